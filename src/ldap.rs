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

//! LDAP SASL bind framing.
//!
//! [LDAPBindFramer] places negotiation tokens in the SASL
//! credentials of an LDAP `BindRequest` (RFC 4511 §4.2) using the
//! `GSSAPI` mechanism (RFC 4752), and extracts the server's token
//! from the `serverSaslCreds` of the `BindResponse`.
use bytes::BytesMut;
use lber::common::TagClass;
use lber::structures::ASNTag;
use lber::structures::Integer;
use lber::structures::OctetString;
use lber::structures::Sequence;
use lber::structures::Tag;
use lber::write;
use ldap_parser::ldap::ProtocolOp;
use ldap_parser::parse_ldap_message;
use log::debug;
use log::trace;

use crate::framer::Framer;
use crate::framer::FramingError;

const LDAP_VERSION: i64 = 3;
const SASL_MECHANISM: &str = "GSSAPI";

/// Result code `success`.
pub const LDAP_SUCCESS: u32 = 0;
/// Result code `saslBindInProgress`.
pub const LDAP_SASL_BIND_IN_PROGRESS: u32 = 14;

/// [Framer] for LDAP SASL `GSSAPI` binds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LDAPBindFramer {
    /// LDAP message ID used for the bind.
    message_id: u32,
    /// Bind DN, normally empty for SASL binds.
    dn: String
}

/// Serialize an LDAP message.
fn encode_message(
    message_id: u32,
    op: Tag
) -> Result<Vec<u8>, FramingError> {
    let msg = Tag::Sequence(Sequence {
        inner: vec![
            Tag::Integer(Integer {
                inner: i64::from(message_id),
                ..Default::default()
            }),
            op,
        ],
        ..Default::default()
    });
    let mut buf = BytesMut::new();

    write::encode_into(&mut buf, msg.into_structure()).map_err(|err| {
        FramingError::Encoding {
            msg: err.to_string()
        }
    })?;

    Ok(buf.to_vec())
}

impl LDAPBindFramer {
    /// Create a framer sending binds as `dn` with `message_id`.
    #[inline]
    pub fn new(
        message_id: u32,
        dn: &str
    ) -> Self {
        LDAPBindFramer {
            message_id: message_id,
            dn: dn.to_string()
        }
    }

    /// Get the LDAP message ID used for the bind.
    #[inline]
    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Get the bind DN.
    #[inline]
    pub fn dn(&self) -> &str {
        &self.dn
    }

    fn bind_request(
        &self,
        token: &[u8]
    ) -> Tag {
        let creds = vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(SASL_MECHANISM),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: token.to_vec(),
                ..Default::default()
            }),
        ];

        Tag::Sequence(Sequence {
            id: 0,
            class: TagClass::Application,
            inner: vec![
                Tag::Integer(Integer {
                    inner: LDAP_VERSION,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: self.dn.as_bytes().to_vec(),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    id: 3,
                    class: TagClass::Context,
                    inner: creds
                }),
            ]
        })
    }
}

impl Default for LDAPBindFramer {
    #[inline]
    fn default() -> Self {
        LDAPBindFramer::new(1, "")
    }
}

impl Framer for LDAPBindFramer {
    fn frame(
        &self,
        token: &[u8]
    ) -> Result<Vec<u8>, FramingError> {
        let msg = encode_message(self.message_id, self.bind_request(token))?;

        trace!(target: "sasl-ldap",
               "framed {} byte token in bind request {}",
               token.len(), self.message_id);

        Ok(msg)
    }

    fn unframe(
        &self,
        msg: &[u8]
    ) -> Result<Vec<u8>, FramingError> {
        let (rest, msg) =
            parse_ldap_message(msg).map_err(|_| FramingError::Malformed)?;

        if !rest.is_empty() {
            return Err(FramingError::Malformed);
        }

        if msg.message_id.0 != self.message_id {
            return Err(FramingError::WrongMessage {
                expected: self.message_id,
                actual: msg.message_id.0
            });
        }

        // Controls on the response are ignored.
        let resp = match msg.protocol_op {
            ProtocolOp::BindResponse(resp) => resp,
            _ => return Err(FramingError::Malformed)
        };

        match resp.result.result_code.0 {
            LDAP_SUCCESS | LDAP_SASL_BIND_IN_PROGRESS => {
                trace!(target: "sasl-ldap",
                       "bind response {} with result code {}",
                       self.message_id, resp.result.result_code.0);
            }
            code => {
                debug!(target: "sasl-ldap",
                       "bind {} rejected with result code {}",
                       self.message_id, code);

                return Err(FramingError::Rejected {
                    code: code,
                    msg: resp.result.diagnostic_message.0.to_string()
                });
            }
        }

        resp.server_sasl_creds
            .map(|creds| creds.to_vec())
            .ok_or(FramingError::MissingToken)
    }
}

#[cfg(test)]
use lber::structures::Enumerated;

#[cfg(test)]
pub(crate) fn bind_response(
    message_id: u32,
    code: u32,
    diag: &str,
    creds: Option<&[u8]>
) -> Vec<u8> {
    let mut resp = vec![
        Tag::Enumerated(Enumerated {
            inner: i64::from(code),
            ..Default::default()
        }),
        Tag::OctetString(OctetString {
            inner: Vec::new(),
            ..Default::default()
        }),
        Tag::OctetString(OctetString {
            inner: Vec::from(diag),
            ..Default::default()
        }),
    ];

    if let Some(creds) = creds {
        resp.push(Tag::OctetString(OctetString {
            id: 7,
            class: TagClass::Context,
            inner: creds.to_vec()
        }));
    }

    let op = Tag::Sequence(Sequence {
        id: 1,
        class: TagClass::Application,
        inner: resp
    });

    encode_message(message_id, op).unwrap()
}

#[test]
fn test_frame_bind_request() {
    let framer = LDAPBindFramer::new(5, "");
    let expected: Vec<u8> = vec![
        0x30, 0x17, // LDAPMessage
        0x02, 0x01, 0x05, // messageID
        0x60, 0x12, // BindRequest
        0x02, 0x01, 0x03, // version
        0x04, 0x00, // name
        0xa3, 0x0b, // SaslCredentials
        0x04, 0x06, b'G', b'S', b'S', b'A', b'P', b'I', 0x04, 0x01, 0xee,
    ];

    assert_eq!(Ok(expected), framer.frame(&[0xee]));
}

#[test]
fn test_frame_parses_as_bind_request() {
    let framer = LDAPBindFramer::new(9, "cn=svc");
    let token = vec![0x11; 1000];
    let msg = framer.frame(&token).unwrap();
    let (rest, msg) = parse_ldap_message(&msg).unwrap();

    assert!(rest.is_empty());
    assert_eq!(9, msg.message_id.0);

    match msg.protocol_op {
        ProtocolOp::BindRequest(req) => {
            assert_eq!(3, req.version);
            assert_eq!("cn=svc", req.name.0);
        }
        _ => panic!("expected bind request")
    }
}

#[test]
fn test_unframe_in_progress() {
    let framer = LDAPBindFramer::new(2, "");
    let resp = bind_response(
        2,
        LDAP_SASL_BIND_IN_PROGRESS,
        "",
        Some(&[0x60, 0x00][..])
    );

    assert_eq!(Ok(vec![0x60, 0x00]), framer.unframe(&resp));
}

#[test]
fn test_unframe_rejected() {
    let framer = LDAPBindFramer::new(2, "");
    let resp = bind_response(2, 49, "invalid credentials", None);

    assert_eq!(
        Err(FramingError::Rejected {
            code: 49,
            msg: String::from("invalid credentials")
        }),
        framer.unframe(&resp)
    );
}

#[test]
fn test_unframe_wrong_message() {
    let framer = LDAPBindFramer::new(2, "");
    let resp = bind_response(3, LDAP_SUCCESS, "", Some(&[0x60, 0x00][..]));

    assert_eq!(
        Err(FramingError::WrongMessage {
            expected: 2,
            actual: 3
        }),
        framer.unframe(&resp)
    );
}

#[test]
fn test_unframe_missing_token() {
    let framer = LDAPBindFramer::new(2, "");
    let resp = bind_response(2, LDAP_SUCCESS, "", None);

    assert_eq!(Err(FramingError::MissingToken), framer.unframe(&resp));
}

#[test]
fn test_unframe_not_bind_response() {
    let framer = LDAPBindFramer::new(2, "");
    let msg = framer.frame(&[0x60, 0x00]).unwrap();

    assert_eq!(Err(FramingError::Malformed), framer.unframe(&msg));
}

#[test]
fn test_unframe_garbage() {
    let framer = LDAPBindFramer::default();

    assert_eq!(Err(FramingError::Malformed), framer.unframe(&[0; 64]));
}
