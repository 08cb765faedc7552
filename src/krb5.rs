// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Kerberos-side types exchanged with the external ticket provider
//! and token codec.
//!
//! Nothing in this module performs Kerberos cryptography.  The
//! [TicketProvider] supplies tickets and session keys; the session
//! only sizes and generates fresh key material for the
//! [Authenticator] and hands everything to a
//! [TokenCodec](crate::token::TokenCodec).
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;

use bitflags::bitflags;
use time::OffsetDateTime;
use zeroize::Zeroizing;

/// Kerberos encryption types (RFC 3961, RFC 3962, RFC 4757, RFC 8009)
/// known to the session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EncType {
    DesCbcCrc,
    DesCbcMd5,
    Des3CbcSha1Kd,
    Aes128CtsHmacSha196,
    Aes256CtsHmacSha196,
    Aes128CtsHmacSha256128,
    Aes256CtsHmacSha384192,
    Rc4Hmac
}

bitflags! {
    /// Context flags requested in the authenticator checksum (RFC 4121
    /// §4.1.1.1).
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct ContextFlags: u32 {
        /// Delegation (`GSS_C_DELEG_FLAG`).
        const DELEG = 0x01;
        /// Mutual authentication (`GSS_C_MUTUAL_FLAG`).
        const MUTUAL = 0x02;
        /// Replay detection (`GSS_C_REPLAY_FLAG`).
        const REPLAY = 0x04;
        /// Sequence checking (`GSS_C_SEQUENCE_FLAG`).
        const SEQUENCE = 0x08;
        /// Confidentiality (`GSS_C_CONF_FLAG`).
        const CONF = 0x10;
        /// Integrity (`GSS_C_INTEG_FLAG`).
        const INTEG = 0x20;
    }
}

/// Symmetric key material tagged with its encryption type.
///
/// The key bytes are held in [Zeroizing] storage, so they are wiped
/// when the key is dropped, and are never printed by the [Debug]
/// instance.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKey {
    /// Raw encryption type number, as issued by the KDC.
    enctype: i32,
    /// Key bytes.
    value: Zeroizing<Vec<u8>>
}

/// Proof-of-possession structure handed to the token codec.
///
/// This carries only the parts the session decides: the requested
/// context flags, the fresh sub-session key, the initial Kerberos
/// sequence number, and the client timestamp.  Client identity comes
/// from the codec's own credentials.
#[derive(Debug)]
pub struct Authenticator {
    flags: ContextFlags,
    subkey: SessionKey,
    seq_number: u32,
    ctime: OffsetDateTime
}

/// Source of service tickets.
///
/// This is implemented by a Kerberos client library holding the
/// caller's credentials.  It is consulted exactly once per handshake.
pub trait TicketProvider {
    /// Opaque service ticket, passed to the
    /// [TokenCodec](crate::token::TokenCodec) unchanged.
    type Ticket;
    /// Errors that can occur obtaining a ticket.
    type Error: Error + Send + Sync + 'static;

    /// Obtain a ticket and session key for `service`.
    fn service_ticket(
        &mut self,
        service: &str
    ) -> Result<(Self::Ticket, SessionKey), Self::Error>;
}

impl EncType {
    /// Get the IANA encryption type number.
    #[inline]
    pub fn number(&self) -> i32 {
        match self {
            EncType::DesCbcCrc => 1,
            EncType::DesCbcMd5 => 3,
            EncType::Des3CbcSha1Kd => 16,
            EncType::Aes128CtsHmacSha196 => 17,
            EncType::Aes256CtsHmacSha196 => 18,
            EncType::Aes128CtsHmacSha256128 => 19,
            EncType::Aes256CtsHmacSha384192 => 20,
            EncType::Rc4Hmac => 23
        }
    }

    /// Size in bytes of a key for this encryption type.
    #[inline]
    pub fn key_size(&self) -> usize {
        match self {
            EncType::DesCbcCrc | EncType::DesCbcMd5 => 8,
            EncType::Des3CbcSha1Kd => 24,
            EncType::Aes128CtsHmacSha196 |
            EncType::Aes128CtsHmacSha256128 |
            EncType::Rc4Hmac => 16,
            EncType::Aes256CtsHmacSha196 |
            EncType::Aes256CtsHmacSha384192 => 32
        }
    }

    /// Whether this encryption type is considered broken (RFC 6649,
    /// RFC 8429).
    #[inline]
    pub fn is_weak(&self) -> bool {
        matches!(
            self,
            EncType::DesCbcCrc |
                EncType::DesCbcMd5 |
                EncType::Des3CbcSha1Kd |
                EncType::Rc4Hmac
        )
    }
}

impl TryFrom<i32> for EncType {
    type Error = i32;

    #[inline]
    fn try_from(val: i32) -> Result<EncType, i32> {
        match val {
            1 => Ok(EncType::DesCbcCrc),
            3 => Ok(EncType::DesCbcMd5),
            16 => Ok(EncType::Des3CbcSha1Kd),
            17 => Ok(EncType::Aes128CtsHmacSha196),
            18 => Ok(EncType::Aes256CtsHmacSha196),
            19 => Ok(EncType::Aes128CtsHmacSha256128),
            20 => Ok(EncType::Aes256CtsHmacSha384192),
            23 => Ok(EncType::Rc4Hmac),
            err => Err(err)
        }
    }
}

impl Display for EncType {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            EncType::DesCbcCrc => write!(f, "des-cbc-crc"),
            EncType::DesCbcMd5 => write!(f, "des-cbc-md5"),
            EncType::Des3CbcSha1Kd => write!(f, "des3-cbc-sha1-kd"),
            EncType::Aes128CtsHmacSha196 => {
                write!(f, "aes128-cts-hmac-sha1-96")
            }
            EncType::Aes256CtsHmacSha196 => {
                write!(f, "aes256-cts-hmac-sha1-96")
            }
            EncType::Aes128CtsHmacSha256128 => {
                write!(f, "aes128-cts-hmac-sha256-128")
            }
            EncType::Aes256CtsHmacSha384192 => {
                write!(f, "aes256-cts-hmac-sha384-192")
            }
            EncType::Rc4Hmac => write!(f, "rc4-hmac")
        }
    }
}

impl SessionKey {
    /// Create a key from a raw encryption type number and key bytes.
    #[inline]
    pub fn new(
        enctype: i32,
        value: Vec<u8>
    ) -> Self {
        SessionKey {
            enctype: enctype,
            value: Zeroizing::new(value)
        }
    }

    /// Get the raw encryption type number.
    #[inline]
    pub fn enctype_number(&self) -> i32 {
        self.enctype
    }

    /// Get the encryption type, if it is one this crate knows.
    #[inline]
    pub fn enctype(&self) -> Option<EncType> {
        EncType::try_from(self.enctype).ok()
    }

    /// Get the key bytes.
    #[inline]
    pub fn value(&self) -> &[u8] {
        self.value.as_slice()
    }
}

impl Debug for SessionKey {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("SessionKey")
            .field("enctype", &self.enctype)
            .field("len", &self.value.len())
            .finish()
    }
}

impl Authenticator {
    /// Create an authenticator stamped with the current time.
    #[inline]
    pub fn new(
        flags: ContextFlags,
        subkey: SessionKey,
        seq_number: u32
    ) -> Self {
        Authenticator {
            flags: flags,
            subkey: subkey,
            seq_number: seq_number,
            ctime: OffsetDateTime::now_utc()
        }
    }

    /// Get the requested context flags.
    #[inline]
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// Get the sub-session key.
    #[inline]
    pub fn subkey(&self) -> &SessionKey {
        &self.subkey
    }

    /// Get the initial Kerberos sequence number.
    #[inline]
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Get the client timestamp.
    #[inline]
    pub fn ctime(&self) -> OffsetDateTime {
        self.ctime
    }

    /// Get the microsecond part of the client timestamp, as carried
    /// in the `cusec` field.
    #[inline]
    pub fn cusec(&self) -> u32 {
        self.ctime.microsecond()
    }
}

#[test]
fn test_enctype_roundtrip_numbers() {
    for num in [1, 3, 16, 17, 18, 19, 20, 23] {
        let enctype = EncType::try_from(num).expect("expected known");

        assert_eq!(num, enctype.number());
    }

    assert_eq!(Err(2), EncType::try_from(2));
}

#[test]
fn test_enctype_key_sizes() {
    assert_eq!(32, EncType::Aes256CtsHmacSha196.key_size());
    assert_eq!(16, EncType::Aes128CtsHmacSha196.key_size());
    assert_eq!(24, EncType::Des3CbcSha1Kd.key_size());
    assert_eq!(8, EncType::DesCbcMd5.key_size());
}

#[test]
fn test_enctype_weak() {
    assert!(EncType::Rc4Hmac.is_weak());
    assert!(EncType::DesCbcCrc.is_weak());
    assert!(!EncType::Aes256CtsHmacSha384192.is_weak());
}

#[test]
fn test_flags() {
    let flags = ContextFlags::INTEG | ContextFlags::CONF;

    assert_eq!(0x30, flags.bits());
    assert!(flags.contains(ContextFlags::CONF));
    assert!(!flags.contains(ContextFlags::MUTUAL));
}

#[test]
fn test_flags_from_wire() {
    let flags = ContextFlags::from_bits_truncate(0x1_0032);

    assert_eq!(
        ContextFlags::MUTUAL | ContextFlags::CONF | ContextFlags::INTEG,
        flags
    );
}

#[test]
fn test_session_key_clone_is_independent() {
    let key = SessionKey::new(17, vec![0x11; 16]);
    let copy = key.clone();

    drop(key);

    assert_eq!(&[0x11; 16][..], copy.value());
}

#[test]
fn test_session_key_debug_redacts() {
    let key = SessionKey::new(18, vec![0x42; 32]);
    let out = format!("{:?}", key);

    assert!(out.contains("enctype: 18"));
    assert!(!out.contains("66"));
}
