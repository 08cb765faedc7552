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

//! Application-protocol framing of negotiation tokens.
//!
//! The session never looks inside the application protocol.  A
//! [Framer] places the serialized negotiation envelope into whatever
//! bind or authentication message the application protocol uses, and
//! extracts the peer's token from the response.
//!
//! Any `Fn(&[u8]) -> Vec<u8>` is a [Framer] whose responses carry the
//! peer's token bare.  [LDAPBindFramer](crate::ldap::LDAPBindFramer)
//! is provided for LDAP.
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;

/// Errors that can occur extracting a token from a framed response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FramingError {
    /// The outbound message could not be encoded.
    Encoding {
        /// Description of the failure.
        msg: String
    },
    /// Response does not have the expected structure.
    Malformed,
    /// Response belongs to a different request.
    WrongMessage {
        /// Identifier that was expected.
        expected: u32,
        /// Identifier that was received.
        actual: u32
    },
    /// Peer rejected the bind.
    Rejected {
        /// Application result code.
        code: u32,
        /// Peer's diagnostic message.
        msg: String
    },
    /// Response carried no token.
    MissingToken
}

/// Transform between negotiation tokens and application-protocol
/// messages.
pub trait Framer {
    /// Wrap an outbound negotiation token.
    ///
    /// This must be a pure function; it is called exactly once per
    /// outbound token, before anything is written.
    fn frame(
        &self,
        token: &[u8]
    ) -> Result<Vec<u8>, FramingError>;

    /// Extract the negotiation token from an inbound message.
    #[inline]
    fn unframe(
        &self,
        msg: &[u8]
    ) -> Result<Vec<u8>, FramingError> {
        Ok(msg.to_vec())
    }
}

/// [Framer] that sends tokens bare.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityFramer;

impl<F> Framer for F
where
    F: Fn(&[u8]) -> Vec<u8>
{
    #[inline]
    fn frame(
        &self,
        token: &[u8]
    ) -> Result<Vec<u8>, FramingError> {
        Ok(self(token))
    }
}

impl Framer for IdentityFramer {
    #[inline]
    fn frame(
        &self,
        token: &[u8]
    ) -> Result<Vec<u8>, FramingError> {
        Ok(token.to_vec())
    }
}

impl Error for FramingError {}

impl Display for FramingError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            FramingError::Encoding { msg } => {
                write!(f, "unable to frame token: {}", msg)
            }
            FramingError::Malformed => write!(f, "malformed response"),
            FramingError::WrongMessage { expected, actual } => write!(
                f,
                "response to message {} (expected {})",
                actual, expected
            ),
            FramingError::Rejected { code, msg } if msg.is_empty() => {
                write!(f, "bind rejected with result code {}", code)
            }
            FramingError::Rejected { code, msg } => {
                write!(f, "bind rejected with result code {} ({})", code, msg)
            }
            FramingError::MissingToken => {
                write!(f, "response carried no negotiation token")
            }
        }
    }
}

#[test]
fn test_closure_framer() {
    let framer = |token: &[u8]| {
        let mut out = vec![0xaa];

        out.extend_from_slice(token);

        out
    };

    assert_eq!(Ok(vec![0xaa, 0x01, 0x02]), framer.frame(&[0x01, 0x02]));
    assert_eq!(Ok(vec![0xbb]), framer.unframe(&[0xbb]));
}

#[test]
fn test_identity_framer() {
    assert_eq!(Ok(vec![0x01, 0x02]), IdentityFramer.frame(&[0x01, 0x02]));
    assert_eq!(Ok(vec![0x03]), IdentityFramer.unframe(&[0x03]));
}
