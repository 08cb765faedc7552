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

//! Configuration structures.
//!
//! [SASLConfig] has a YAML format, which can be parsed using
//! `serde_yaml`, thus allowing session parameters to be loaded from
//! text files.  Service names and credentials are deliberately not
//! part of the configuration; they are supplied to
//! [connect](crate::session::SASLSession::connect) directly.
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::krb5::ContextFlags;

/// Largest SASL security layer buffer (RFC 4422 §3.7).
pub const MAX_BUFFER_SIZE: usize = 0x00ff_ffff;

/// Configuration for a [SASLSession](crate::session::SASLSession).
///
/// # YAML Format
///
/// The YAML format has five fields, all of which are optional:
///
///  - `max-negotiate-size`: Size of the buffer used to read the peer's
///    negotiation response.  Must be nonzero.  The default is 65536.
///
///  - `max-message-size`: Largest protected message that will be sent
///    or accepted once a security layer is in use.  Must be nonzero
///    and no larger than 16777215, the largest SASL buffer size,
///    which is also the default.
///
///  - `integrity`: Whether to request per-message integrity.  The
///    default is `true`.
///
///  - `confidentiality`: Whether to request per-message
///    confidentiality.  The default is `true`.
///
///  - `allow-weak-enctypes`: Whether to accept session keys using DES,
///    3DES, or RC4 encryption types.  The default is `false`.
///
/// ## Examples
///
/// The following is an example of the YAML format:
///
/// ```yaml
/// max-negotiate-size: 32768
/// confidentiality: false
/// ```
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename = "sasl")]
#[serde(rename_all = "kebab-case")]
#[serde(try_from = "SASLConfigFields")]
pub struct SASLConfig {
    /// Size of the negotiation response buffer.
    max_negotiate_size: usize,
    /// Largest protected message.
    max_message_size: usize,
    /// Whether to request integrity.
    integrity: bool,
    /// Whether to request confidentiality.
    confidentiality: bool,
    /// Whether to accept weak encryption types.
    allow_weak_enctypes: bool
}

/// Unchecked form of [SASLConfig], as it appears in YAML.
#[derive(Deserialize)]
#[serde(rename = "sasl")]
#[serde(rename_all = "kebab-case")]
struct SASLConfigFields {
    #[serde(default = "SASLConfig::default_max_negotiate_size")]
    max_negotiate_size: usize,
    #[serde(default = "SASLConfig::default_max_message_size")]
    max_message_size: usize,
    #[serde(default = "SASLConfig::default_integrity")]
    integrity: bool,
    #[serde(default = "SASLConfig::default_confidentiality")]
    confidentiality: bool,
    #[serde(default)]
    allow_weak_enctypes: bool
}

/// Errors that can occur creating a [SASLConfig].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum SASLConfigError {
    /// The negotiation buffer would be empty.
    ZeroNegotiateSize,
    /// The message size is zero or above [MAX_BUFFER_SIZE].
    MessageSize {
        /// The rejected size.
        size: usize
    }
}

impl SASLConfig {
    /// Create a configuration, checking the size limits.
    #[inline]
    pub fn new(
        max_negotiate_size: usize,
        max_message_size: usize,
        integrity: bool,
        confidentiality: bool,
        allow_weak_enctypes: bool
    ) -> Result<Self, SASLConfigError> {
        if max_negotiate_size == 0 {
            return Err(SASLConfigError::ZeroNegotiateSize);
        }

        if max_message_size == 0 || max_message_size > MAX_BUFFER_SIZE {
            return Err(SASLConfigError::MessageSize {
                size: max_message_size
            });
        }

        Ok(SASLConfig {
            max_negotiate_size: max_negotiate_size,
            max_message_size: max_message_size,
            integrity: integrity,
            confidentiality: confidentiality,
            allow_weak_enctypes: allow_weak_enctypes
        })
    }

    #[inline]
    fn default_max_negotiate_size() -> usize {
        65536
    }

    #[inline]
    fn default_max_message_size() -> usize {
        MAX_BUFFER_SIZE
    }

    #[inline]
    fn default_integrity() -> bool {
        true
    }

    #[inline]
    fn default_confidentiality() -> bool {
        true
    }

    /// Get the size of the negotiation response buffer.
    #[inline]
    pub fn max_negotiate_size(&self) -> usize {
        self.max_negotiate_size
    }

    /// Get the largest protected message size.
    #[inline]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    #[inline]
    pub fn integrity(&self) -> bool {
        self.integrity
    }

    #[inline]
    pub fn confidentiality(&self) -> bool {
        self.confidentiality
    }

    #[inline]
    pub fn allow_weak_enctypes(&self) -> bool {
        self.allow_weak_enctypes
    }

    /// Get the context flags to request in the authenticator.
    ///
    /// Mutual authentication is always requested.
    pub fn flags(&self) -> ContextFlags {
        let mut flags = ContextFlags::MUTUAL;

        if self.integrity {
            flags |= ContextFlags::INTEG;
        }

        if self.confidentiality {
            flags |= ContextFlags::CONF;
        }

        flags
    }
}

impl Default for SASLConfig {
    #[inline]
    fn default() -> Self {
        SASLConfig {
            max_negotiate_size: SASLConfig::default_max_negotiate_size(),
            max_message_size: SASLConfig::default_max_message_size(),
            integrity: SASLConfig::default_integrity(),
            confidentiality: SASLConfig::default_confidentiality(),
            allow_weak_enctypes: false
        }
    }
}

impl TryFrom<SASLConfigFields> for SASLConfig {
    type Error = SASLConfigError;

    #[inline]
    fn try_from(
        fields: SASLConfigFields
    ) -> Result<SASLConfig, SASLConfigError> {
        SASLConfig::new(
            fields.max_negotiate_size,
            fields.max_message_size,
            fields.integrity,
            fields.confidentiality,
            fields.allow_weak_enctypes
        )
    }
}

impl Error for SASLConfigError {}

impl Display for SASLConfigError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            SASLConfigError::ZeroNegotiateSize => {
                write!(f, "negotiation buffer size must be nonzero")
            }
            SASLConfigError::MessageSize { size } => write!(
                f,
                "message size {} outside of 1 to {}",
                size, MAX_BUFFER_SIZE
            )
        }
    }
}

#[test]
fn test_deserialize_empty_cfg() {
    let yaml = "{}";
    let actual: SASLConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(SASLConfig::default(), actual)
}

#[test]
fn test_deserialize_sasl_cfg() {
    let yaml = concat!(
        "max-negotiate-size: 32768\n",
        "max-message-size: 4096\n",
        "confidentiality: false\n",
        "allow-weak-enctypes: true\n"
    );
    let expected = SASLConfig {
        max_negotiate_size: 32768,
        max_message_size: 4096,
        integrity: true,
        confidentiality: false,
        allow_weak_enctypes: true
    };
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual)
}

#[test]
fn test_deserialize_bad_field() {
    let yaml = "max-negotiate-size: lots\n";
    let actual: Result<SASLConfig, _> = serde_yaml::from_str(yaml);

    assert!(actual.is_err())
}

#[test]
fn test_deserialize_zero_negotiate_size() {
    let yaml = "max-negotiate-size: 0\n";
    let actual: Result<SASLConfig, _> = serde_yaml::from_str(yaml);

    assert!(actual.is_err())
}

#[test]
fn test_deserialize_huge_message_size() {
    let yaml = "max-message-size: 4294967296\n";
    let actual: Result<SASLConfig, _> = serde_yaml::from_str(yaml);

    assert!(actual.is_err())
}

#[test]
fn test_new_checks_limits() {
    assert_eq!(
        Err(SASLConfigError::ZeroNegotiateSize),
        SASLConfig::new(0, 4096, true, true, false)
    );
    assert_eq!(
        Err(SASLConfigError::MessageSize { size: 0 }),
        SASLConfig::new(4096, 0, true, true, false)
    );
    assert_eq!(
        Err(SASLConfigError::MessageSize {
            size: MAX_BUFFER_SIZE + 1
        }),
        SASLConfig::new(4096, MAX_BUFFER_SIZE + 1, true, true, false)
    );
    assert!(SASLConfig::new(1, MAX_BUFFER_SIZE, true, true, false).is_ok());
}

#[test]
fn test_flags() {
    let config = SASLConfig::new(1024, 1024, true, false, false).unwrap();

    assert!(config.flags().contains(ContextFlags::MUTUAL));
    assert!(config.flags().contains(ContextFlags::INTEG));
    assert!(!config.flags().contains(ContextFlags::CONF));
}
