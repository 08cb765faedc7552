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

//! Errors that can occur in a [SASLSession](crate::session::SASLSession).
//!
//! Errors fall into five categories, given by [ErrorCategory], each
//! calling for a different remedy: credential errors call for
//! re-authentication, transport errors for a new connection, and the
//! rest for abandoning the session.
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::ErrorKind;

use openssl::error::ErrorStack;

use crate::framer::FramingError;
use crate::krb5::EncType;
use crate::token::EnvelopeError;
use crate::token::TokenKind;

/// Boxed error from an external collaborator.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Broad classification of a [SASLError].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCategory {
    /// No usable ticket could be obtained.
    Credential,
    /// Token or envelope construction failed.
    Encoding,
    /// The underlying stream failed.
    Transport,
    /// The peer did not follow the protocol, or the session was
    /// misused.
    Protocol,
    /// A protected message failed verification.
    Integrity
}

/// Errors from a [SASLSession](crate::session::SASLSession).
#[derive(Debug)]
pub enum SASLError {
    /// The ticket provider failed.
    Ticket {
        /// Error from the ticket provider.
        error: BoxError
    },
    /// Building the request failed.
    Encoding {
        /// Detailed error.
        error: EncodingError
    },
    /// The underlying stream failed.
    Transport {
        /// Detailed error.
        error: TransportError
    },
    /// Protocol violation or rejection.
    Protocol {
        /// Detailed error.
        error: ProtocolError
    },
    /// Message protection failure.
    Integrity {
        /// Detailed error.
        error: IntegrityError
    }
}

/// Errors that can occur building the authentication request.
#[derive(Debug)]
pub enum EncodingError {
    /// Session key uses an unknown encryption type.
    UnsupportedEncType {
        /// Raw encryption type number.
        enctype: i32
    },
    /// Session key uses a weak encryption type that is not allowed.
    WeakEncType {
        /// The encryption type.
        enctype: EncType
    },
    /// Generating random key material failed.
    Random {
        /// Error from OpenSSL.
        error: ErrorStack
    },
    /// The token codec failed.
    Codec {
        /// Error from the codec.
        error: BoxError
    },
    /// The envelope could not be serialized.
    Envelope {
        /// Error from the envelope.
        error: EnvelopeError
    },
    /// The framer could not frame the request.
    Framing {
        /// Error from the framer.
        error: FramingError
    }
}

/// Errors from the underlying stream.
#[derive(Debug)]
pub enum TransportError {
    /// Low-level IO error.
    IO {
        /// IO error.
        error: std::io::Error
    },
    /// The stream accepted only part of the negotiation message.
    ShortWrite {
        /// Bytes accepted.
        written: usize,
        /// Bytes offered.
        len: usize
    },
    /// The stream was closed by the peer.
    Closed
}

/// Protocol violations and session misuse.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProtocolError {
    /// The peer's response could not be unframed.
    Framing {
        /// Error from the framer.
        error: FramingError
    },
    /// The peer's response is not a negotiation envelope.
    Envelope {
        /// Error from the envelope.
        error: EnvelopeError
    },
    /// The peer's response is not an authentication reply.
    NotAuthReply {
        /// Kind of token that was received instead.
        kind: TokenKind
    },
    /// The session is already authenticated.
    AlreadyAuthenticated,
    /// The session is not yet authenticated.
    NotAuthenticated,
    /// The session has failed and cannot be used.
    SessionFailed,
    /// A message is too large to protect.
    MessageTooLarge {
        /// Size of the message.
        len: usize,
        /// Largest allowed size.
        max: usize
    }
}

/// Message protection failures.
///
/// All of these are fatal to the session.
#[derive(Debug)]
pub enum IntegrityError {
    /// The security layer failed to wrap or unwrap a message.
    Layer {
        /// Error from the security layer.
        error: BoxError
    },
    /// A message arrived out of sequence.
    Sequence {
        /// Expected sequence number.
        expected: u32,
        /// Received sequence number.
        actual: u32
    },
    /// An unwrapped message was too short to hold a sequence number.
    Truncated,
    /// A protected buffer exceeded the maximum size.
    Oversize {
        /// Size of the buffer.
        len: usize,
        /// Largest allowed size.
        max: usize
    },
    /// The sequence number space is used up.
    SequenceExhausted
}

impl SASLError {
    /// Get the category of this error.
    #[inline]
    pub fn category(&self) -> ErrorCategory {
        match self {
            SASLError::Ticket { .. } => ErrorCategory::Credential,
            SASLError::Encoding { .. } => ErrorCategory::Encoding,
            SASLError::Transport { .. } => ErrorCategory::Transport,
            SASLError::Protocol { .. } => ErrorCategory::Protocol,
            SASLError::Integrity { .. } => ErrorCategory::Integrity
        }
    }

    #[inline]
    pub(crate) fn io(error: std::io::Error) -> Self {
        SASLError::Transport {
            error: TransportError::IO { error: error }
        }
    }

    #[inline]
    pub(crate) fn protocol(error: ProtocolError) -> Self {
        SASLError::Protocol { error: error }
    }

    #[inline]
    pub(crate) fn integrity(error: IntegrityError) -> Self {
        SASLError::Integrity { error: error }
    }

    #[inline]
    pub(crate) fn encoding(error: EncodingError) -> Self {
        SASLError::Encoding { error: error }
    }
}

impl From<SASLError> for std::io::Error {
    #[inline]
    fn from(err: SASLError) -> std::io::Error {
        match err {
            SASLError::Transport {
                error: TransportError::IO { error }
            } => error,
            err => std::io::Error::new(ErrorKind::Other, err)
        }
    }
}

impl Display for ErrorCategory {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ErrorCategory::Credential => write!(f, "credential"),
            ErrorCategory::Encoding => write!(f, "encoding"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Integrity => write!(f, "integrity")
        }
    }
}

impl Error for SASLError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SASLError::Ticket { error } => Some(&**error),
            SASLError::Encoding { error } => Some(error),
            SASLError::Transport { error } => Some(error),
            SASLError::Protocol { error } => Some(error),
            SASLError::Integrity { error } => Some(error)
        }
    }
}

impl Error for EncodingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EncodingError::Random { error } => Some(error),
            EncodingError::Codec { error } => Some(&**error),
            EncodingError::Envelope { error } => Some(error),
            EncodingError::Framing { error } => Some(error),
            _ => None
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::IO { error } => Some(error),
            _ => None
        }
    }
}

impl Error for ProtocolError {}

impl Error for IntegrityError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IntegrityError::Layer { error } => Some(&**error),
            _ => None
        }
    }
}

impl Display for SASLError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            SASLError::Ticket { error } => {
                write!(f, "unable to obtain service ticket: {}", error)
            }
            SASLError::Encoding { error } => error.fmt(f),
            SASLError::Transport { error } => error.fmt(f),
            SASLError::Protocol { error } => error.fmt(f),
            SASLError::Integrity { error } => error.fmt(f)
        }
    }
}

impl Display for EncodingError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            EncodingError::UnsupportedEncType { enctype } => {
                write!(f, "unsupported encryption type {}", enctype)
            }
            EncodingError::WeakEncType { enctype } => {
                write!(f, "weak encryption type {} not allowed", enctype)
            }
            EncodingError::Random { error } => {
                write!(f, "unable to generate key material: {}", error)
            }
            EncodingError::Codec { error } => {
                write!(f, "unable to build authentication request: {}", error)
            }
            EncodingError::Envelope { error } => error.fmt(f),
            EncodingError::Framing { error } => error.fmt(f)
        }
    }
}

impl Display for TransportError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            TransportError::IO { error } => error.fmt(f),
            TransportError::ShortWrite { written, len } => {
                write!(f, "short write ({} of {} bytes)", written, len)
            }
            TransportError::Closed => write!(f, "connection closed by peer")
        }
    }
}

impl Display for ProtocolError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ProtocolError::Framing { error } => error.fmt(f),
            ProtocolError::Envelope { error } => error.fmt(f),
            ProtocolError::NotAuthReply { kind } => write!(
                f,
                "authentication rejected (received {} instead of AP-REP)",
                kind
            ),
            ProtocolError::AlreadyAuthenticated => {
                write!(f, "session is already authenticated")
            }
            ProtocolError::NotAuthenticated => {
                write!(f, "session is not authenticated")
            }
            ProtocolError::SessionFailed => write!(f, "session has failed"),
            ProtocolError::MessageTooLarge { len, max } => write!(
                f,
                "message of {} bytes exceeds maximum of {}",
                len, max
            )
        }
    }
}

impl Display for IntegrityError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            IntegrityError::Layer { error } => {
                write!(f, "message protection failed: {}", error)
            }
            IntegrityError::Sequence { expected, actual } => write!(
                f,
                "bad sequence number {} (expected {})",
                actual, expected
            ),
            IntegrityError::Truncated => write!(f, "truncated message"),
            IntegrityError::Oversize { len, max } => write!(
                f,
                "protected buffer of {} bytes exceeds maximum of {}",
                len, max
            ),
            IntegrityError::SequenceExhausted => {
                write!(f, "sequence numbers exhausted")
            }
        }
    }
}

#[test]
fn test_categories() {
    let err = SASLError::Ticket {
        error: Box::new(std::io::Error::new(ErrorKind::NotFound, "no tgt"))
    };

    assert_eq!(ErrorCategory::Credential, err.category());
    assert_eq!(
        ErrorCategory::Transport,
        SASLError::io(std::io::Error::from(ErrorKind::BrokenPipe)).category()
    );
    assert_eq!(
        ErrorCategory::Integrity,
        SASLError::integrity(IntegrityError::Truncated).category()
    );
}

#[test]
fn test_io_conversion_preserves_transport() {
    let err = SASLError::io(std::io::Error::from(ErrorKind::BrokenPipe));
    let err: std::io::Error = err.into();

    assert_eq!(ErrorKind::BrokenPipe, err.kind());
}

#[test]
fn test_io_conversion_wraps_others() {
    let err = SASLError::protocol(ProtocolError::SessionFailed);
    let err: std::io::Error = err.into();
    let inner = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<SASLError>())
        .expect("expected SASL error");

    assert_eq!(ErrorCategory::Protocol, inner.category());
}
