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

//! Negotiation envelopes.
//!
//! GSSAPI mechanism tokens travel inside the generic token framing of
//! RFC 2743 §3.1:
//!
//! ```text
//! [APPLICATION 0] IMPLICIT SEQUENCE {
//!     thisMech    MechType,
//!     innerToken  ANY DEFINED BY thisMech
//! }
//! ```
//!
//! For Kerberos (RFC 4121 §4.1), the inner token is a two-byte token
//! identifier followed by the Kerberos message.  The token identifier
//! lets the session classify a reply without parsing the Kerberos
//! message itself; that parsing belongs to the [TokenCodec].
use std::borrow::Cow;
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;

use asn1_rs::Class;
use asn1_rs::Header;
use asn1_rs::Length;
use asn1_rs::Tag;
use asn1_rs::ToDer;
use der_parser::ber::parse_ber_tagged_implicit_g;
use der_parser::der::der_read_element_header;
use der_parser::der::parse_der_oid;
use der_parser::error::BerError;
use der_parser::error::BerResult;
use der_parser::oid;
use der_parser::oid::Oid;
use nom::number::complete::be_u16;

use crate::krb5::Authenticator;
use crate::krb5::SessionKey;

/// Kerberos V5 mechanism OID.
#[rustfmt::skip::macros(oid)]
pub const KRB5_MECH_OID: Oid<'static> = oid!(1.2.840.113554.1.2.2);

/// Tag number of the `[APPLICATION 0]` generic token framing.
const TAG_GENERIC_TOKEN: u32 = 0;

const TOK_ID_AP_REQ: u16 = 0x0100;
const TOK_ID_AP_REP: u16 = 0x0200;
const TOK_ID_KRB_ERROR: u16 = 0x0300;

/// Outer tag of a Kerberos `AP-REP` (`[APPLICATION 15]`).
const TAG_AP_REP: u8 = 0x6f;

/// Largest inner token that can be framed.
const MAX_TOKEN_LEN: usize = u32::MAX as usize - 64;

/// Kind of a mechanism token, from its token identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TokenKind {
    /// Authentication request (`KRB_AP_REQ`).
    ApReq,
    /// Authentication reply (`KRB_AP_REP`).
    ApRep,
    /// Kerberos error (`KRB_ERROR`).
    KrbError,
    /// Any other token identifier.
    Other(u16)
}

/// A mechanism token in its generic framing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MechToken {
    /// Mechanism OID.
    mech: Oid<'static>,
    /// Token kind.
    kind: TokenKind,
    /// Mechanism message following the token identifier.
    body: Vec<u8>
}

/// Errors that can occur encoding or decoding a [MechToken].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EnvelopeError {
    /// No bytes to decode.
    Empty,
    /// Bytes are not a generic token.
    Malformed,
    /// Bytes remain after the token.
    TrailingData {
        /// Number of leftover bytes.
        len: usize
    },
    /// Token is too large to frame.
    TooLarge {
        /// Size of the inner token.
        len: usize
    },
    /// DER serialization failed.
    Serialize,
    /// The peer rejected mechanism negotiation.
    Rejected
}

/// Codec for authentication tokens and negotiation envelopes.
///
/// Building the `AP-REQ` is left to a Kerberos message library.  The
/// envelope operations have default implementations using
/// [MechToken]; implementors only override them for nonstandard
/// peers.
pub trait TokenCodec {
    /// Type of service tickets accepted.
    type Ticket;
    /// Errors that can occur building an authentication request.
    type Error: Error + Send + Sync + 'static;

    /// Build the encoded `AP-REQ` for `ticket`, sealing `auth` under
    /// `key`.
    fn build_auth_request(
        &self,
        ticket: &Self::Ticket,
        key: &SessionKey,
        auth: &Authenticator
    ) -> Result<Vec<u8>, Self::Error>;

    /// Serialize a negotiation envelope.
    #[inline]
    fn encode_envelope(
        &self,
        token: &MechToken
    ) -> Result<Vec<u8>, EnvelopeError> {
        token.encode()
    }

    /// Deserialize a negotiation envelope.
    #[inline]
    fn decode_envelope(
        &self,
        buf: &[u8]
    ) -> Result<MechToken, EnvelopeError> {
        MechToken::decode(buf)
    }

    /// Check whether a decoded envelope is an authentication reply.
    #[inline]
    fn is_auth_reply(
        &self,
        token: &MechToken
    ) -> bool {
        token.is_ap_rep()
    }
}

impl TokenKind {
    /// Get the two-byte token identifier.
    #[inline]
    pub fn id(&self) -> u16 {
        match self {
            TokenKind::ApReq => TOK_ID_AP_REQ,
            TokenKind::ApRep => TOK_ID_AP_REP,
            TokenKind::KrbError => TOK_ID_KRB_ERROR,
            TokenKind::Other(id) => *id
        }
    }
}

impl From<u16> for TokenKind {
    #[inline]
    fn from(id: u16) -> TokenKind {
        match id {
            TOK_ID_AP_REQ => TokenKind::ApReq,
            TOK_ID_AP_REP => TokenKind::ApRep,
            TOK_ID_KRB_ERROR => TokenKind::KrbError,
            other => TokenKind::Other(other)
        }
    }
}

impl Display for TokenKind {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            TokenKind::ApReq => write!(f, "AP-REQ"),
            TokenKind::ApRep => write!(f, "AP-REP"),
            TokenKind::KrbError => write!(f, "KRB-ERROR"),
            TokenKind::Other(id) => write!(f, "unknown token {:#06x}", id)
        }
    }
}

fn parse_generic_token<'a>(
    i: &'a [u8]
) -> BerResult<'a, (Oid<'a>, u16, &'a [u8])> {
    let (_, hdr) = der_read_element_header(i)?;

    if !(hdr.is_constructed() &&
        hdr.is_application() &&
        hdr.tag().0 == TAG_GENERIC_TOKEN)
    {
        return Err(nom::Err::Error(BerError::BerTypeError));
    }

    parse_ber_tagged_implicit_g(TAG_GENERIC_TOKEN, |i, _hdr, _depth| {
        let (i, obj) = parse_der_oid(i)?;
        let mech = obj.as_oid().map_err(nom::Err::Error)?.clone();
        // The token identifier and body fill the rest of the content.
        let (body, id) = be_u16(i)?;

        Ok((&body[body.len()..], (mech, id, body)))
    })(i)
}

impl MechToken {
    /// Create a token for an arbitrary mechanism.
    #[inline]
    pub fn new(
        mech: Oid<'static>,
        kind: TokenKind,
        body: Vec<u8>
    ) -> Self {
        MechToken {
            mech: mech,
            kind: kind,
            body: body
        }
    }

    /// Create a Kerberos V5 token.
    #[inline]
    pub fn krb5(
        kind: TokenKind,
        body: Vec<u8>
    ) -> Self {
        MechToken::new(KRB5_MECH_OID, kind, body)
    }

    /// Get the mechanism OID.
    #[inline]
    pub fn mech(&self) -> &Oid<'static> {
        &self.mech
    }

    /// Check whether this is a Kerberos V5 token.
    #[inline]
    pub fn is_krb5(&self) -> bool {
        self.mech == KRB5_MECH_OID
    }

    /// Get the token kind.
    #[inline]
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// Get the mechanism message.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take the mechanism message.
    #[inline]
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Check whether this is a Kerberos `AP-REP`.
    ///
    /// This checks the mechanism, the token identifier, and the outer
    /// tag of the message, but does not parse the message.
    #[inline]
    pub fn is_ap_rep(&self) -> bool {
        self.is_krb5() &&
            self.kind == TokenKind::ApRep &&
            self.body.first() == Some(&TAG_AP_REP)
    }

    /// Encode in the generic token framing.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let len = self.mech.as_bytes().len() + self.body.len() + 2;

        if len > MAX_TOKEN_LEN {
            return Err(EnvelopeError::TooLarge { len: len });
        }

        let mut content = self
            .mech
            .to_der_vec()
            .map_err(|_| EnvelopeError::Serialize)?;

        content.reserve(self.body.len() + 2);
        content.extend_from_slice(&self.kind.id().to_be_bytes());
        content.extend_from_slice(&self.body);

        let header = Header::new(
            Class::Application,
            true,
            Tag(TAG_GENERIC_TOKEN),
            Length::Definite(content.len())
        );
        let mut out =
            header.to_der_vec().map_err(|_| EnvelopeError::Serialize)?;

        out.extend(content);

        Ok(out)
    }

    /// Decode from the generic token framing.
    ///
    /// The buffer must hold exactly one token.
    pub fn decode(buf: &[u8]) -> Result<MechToken, EnvelopeError> {
        if buf.is_empty() {
            return Err(EnvelopeError::Empty);
        }

        let (rest, (mech, id, body)) =
            parse_generic_token(buf).map_err(|_| EnvelopeError::Malformed)?;

        if !rest.is_empty() {
            return Err(EnvelopeError::TrailingData { len: rest.len() });
        }

        Ok(MechToken {
            mech: Oid::new(Cow::Owned(mech.as_bytes().to_vec())),
            kind: TokenKind::from(id),
            body: body.to_vec()
        })
    }
}

impl Error for EnvelopeError {}

impl Display for EnvelopeError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            EnvelopeError::Empty => write!(f, "empty negotiation token"),
            EnvelopeError::Malformed => {
                write!(f, "malformed negotiation token")
            }
            EnvelopeError::TrailingData { len } => {
                write!(f, "{} bytes trailing negotiation token", len)
            }
            EnvelopeError::TooLarge { len } => {
                write!(f, "negotiation token too large ({} bytes)", len)
            }
            EnvelopeError::Serialize => {
                write!(f, "unable to serialize negotiation token")
            }
            EnvelopeError::Rejected => {
                write!(f, "peer rejected mechanism negotiation")
            }
        }
    }
}

#[test]
fn test_encode_ap_req() {
    let token = MechToken::krb5(TokenKind::ApReq, vec![0x6e, 0x00]);
    let expected = vec![
        0x60, 0x0f, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01,
        0x02, 0x02, 0x01, 0x00, 0x6e, 0x00,
    ];

    assert_eq!(expected, token.encode().unwrap());
}

#[test]
fn test_decode_ap_rep() {
    let buf = MechToken::krb5(TokenKind::ApRep, vec![0x6f, 0x03, 1, 2, 3])
        .encode()
        .unwrap();
    let token = MechToken::decode(&buf).unwrap();

    assert!(token.is_krb5());
    assert_eq!(TokenKind::ApRep, token.kind());
    assert!(token.is_ap_rep());
}

#[test]
fn test_request_is_not_reply() {
    let buf = MechToken::krb5(TokenKind::ApReq, vec![0x6e, 0x00])
        .encode()
        .unwrap();
    let token = MechToken::decode(&buf).unwrap();

    assert_eq!(TokenKind::ApReq, token.kind());
    assert!(!token.is_ap_rep());
}

#[test]
fn test_reply_needs_krb5_mech() {
    let token =
        MechToken::new(oid!(1.3.6.1.5.5.2), TokenKind::ApRep, vec![0x6f, 0x00]);

    assert!(!token.is_ap_rep());
}

#[test]
fn test_reply_needs_ap_rep_body() {
    let token = MechToken::krb5(TokenKind::ApRep, vec![0x7e, 0x00]);

    assert!(!token.is_ap_rep());
}

#[test]
fn test_decode_unknown_id() {
    let buf = MechToken::krb5(TokenKind::Other(0x0404), vec![])
        .encode()
        .unwrap();
    let token = MechToken::decode(&buf).unwrap();

    assert_eq!(TokenKind::Other(0x0404), token.kind());
}

#[test]
fn test_decode_garbage() {
    assert_eq!(Err(EnvelopeError::Malformed), MechToken::decode(&[0; 4096]));
    assert_eq!(Err(EnvelopeError::Empty), MechToken::decode(&[]));
}

#[test]
fn test_decode_truncated() {
    let buf = MechToken::krb5(TokenKind::ApRep, vec![0x6f; 200])
        .encode()
        .unwrap();

    assert_eq!(
        Err(EnvelopeError::Malformed),
        MechToken::decode(&buf[..buf.len() - 1])
    );
}

#[test]
fn test_decode_trailing() {
    let mut buf = MechToken::krb5(TokenKind::ApRep, vec![0x6f, 0x00])
        .encode()
        .unwrap();

    buf.extend_from_slice(&[0, 0, 0]);

    assert_eq!(
        Err(EnvelopeError::TrailingData { len: 3 }),
        MechToken::decode(&buf)
    );
}
