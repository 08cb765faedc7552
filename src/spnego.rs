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

//! `GSS-SPNEGO` envelopes (RFC 4178).
//!
//! Some peers only accept Kerberos tokens offered through SPNEGO.
//! [SPNEGOCodec] wraps another [TokenCodec] and places its Kerberos
//! token in a `NegTokenInit` naming Kerberos as the only mechanism:
//!
//! ```text
//! [APPLICATION 0] {
//!     1.3.6.1.5.5.2,
//!     [0] NegTokenInit ::= SEQUENCE {
//!         mechTypes   [0] SEQUENCE OF MechType,
//!         mechToken   [2] OCTET STRING } }
//! ```
//!
//! Replies may be a `NegTokenResp` carrying the Kerberos token in its
//! `responseToken`, or the bare Kerberos token.
use asn1_rs::Any;
use asn1_rs::Class;
use asn1_rs::Enumerated;
use asn1_rs::FromDer;
use asn1_rs::Header;
use asn1_rs::Length;
use asn1_rs::Tag;
use asn1_rs::ToDer;
use der_parser::oid;
use der_parser::oid::Oid;
use log::debug;

use crate::krb5::Authenticator;
use crate::krb5::SessionKey;
use crate::token::EnvelopeError;
use crate::token::MechToken;
use crate::token::TokenCodec;

/// SPNEGO pseudo-mechanism OID.
#[rustfmt::skip::macros(oid)]
pub const SPNEGO_MECH_OID: Oid<'static> = oid!(1.3.6.1.5.5.2);

/// First octet of a `NegTokenResp` (`[1]`, constructed).
const TAG_NEG_TOKEN_RESP: u8 = 0xa1;

/// `negState` value `reject`.
const NEG_STATE_REJECT: u32 = 2;

/// [TokenCodec] sending the inner codec's tokens through SPNEGO.
#[derive(Clone, Debug, Default)]
pub struct SPNEGOCodec<C> {
    inner: C
}

fn tagged(
    class: Class,
    constructed: bool,
    tag: Tag,
    content: Vec<u8>
) -> Result<Vec<u8>, EnvelopeError> {
    let header =
        Header::new(class, constructed, tag, Length::Definite(content.len()));
    let mut out = header.to_der_vec().map_err(|_| EnvelopeError::Serialize)?;

    out.extend(content);

    Ok(out)
}

fn encode_neg_token_init(
    mech: &Oid<'static>,
    mech_token: Vec<u8>
) -> Result<Vec<u8>, EnvelopeError> {
    let mech = mech.to_der_vec().map_err(|_| EnvelopeError::Serialize)?;
    let mech_types = tagged(Class::Universal, true, Tag::Sequence, mech)?;
    let mut fields =
        tagged(Class::ContextSpecific, true, Tag(0), mech_types)?;
    let token = tagged(Class::Universal, false, Tag::OctetString, mech_token)?;

    fields.extend(tagged(Class::ContextSpecific, true, Tag(2), token)?);

    let init = tagged(Class::Universal, true, Tag::Sequence, fields)?;
    let mut content = SPNEGO_MECH_OID
        .to_der_vec()
        .map_err(|_| EnvelopeError::Serialize)?;

    content.extend(tagged(Class::ContextSpecific, true, Tag(0), init)?);

    tagged(Class::Application, true, Tag(0), content)
}

/// Get the `responseToken` out of a `NegTokenResp`.
fn decode_neg_token_resp(buf: &[u8]) -> Result<&[u8], EnvelopeError> {
    let (rest, choice) =
        Any::from_der(buf).map_err(|_| EnvelopeError::Malformed)?;

    if !rest.is_empty() {
        return Err(EnvelopeError::TrailingData { len: rest.len() });
    }

    if choice.header.class() != Class::ContextSpecific ||
        choice.header.tag() != Tag(1)
    {
        return Err(EnvelopeError::Malformed);
    }

    let (_, resp) =
        Any::from_der(choice.data).map_err(|_| EnvelopeError::Malformed)?;

    if resp.header.tag() != Tag::Sequence {
        return Err(EnvelopeError::Malformed);
    }

    let mut fields = resp.data;
    let mut state = None;
    let mut token = None;

    // supportedMech and mechListMIC are not needed.
    while !fields.is_empty() {
        let (next, field) =
            Any::from_der(fields).map_err(|_| EnvelopeError::Malformed)?;

        match field.header.tag().0 {
            0 => {
                let (_, negstate) = Enumerated::from_der(field.data)
                    .map_err(|_| EnvelopeError::Malformed)?;

                state = Some(negstate.0);
            }
            2 => {
                let (_, octets) = Any::from_der(field.data)
                    .map_err(|_| EnvelopeError::Malformed)?;

                token = Some(octets.data);
            }
            _ => {}
        }

        fields = next;
    }

    if state == Some(NEG_STATE_REJECT) {
        debug!(target: "sasl-spnego",
               "peer rejected SPNEGO negotiation");

        return Err(EnvelopeError::Rejected);
    }

    token.ok_or(EnvelopeError::Malformed)
}

impl<C> SPNEGOCodec<C> {
    #[inline]
    pub fn new(inner: C) -> Self {
        SPNEGOCodec { inner: inner }
    }

    #[inline]
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    #[inline]
    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C> TokenCodec for SPNEGOCodec<C>
where
    C: TokenCodec
{
    type Error = C::Error;
    type Ticket = C::Ticket;

    #[inline]
    fn build_auth_request(
        &self,
        ticket: &C::Ticket,
        key: &SessionKey,
        auth: &Authenticator
    ) -> Result<Vec<u8>, C::Error> {
        self.inner.build_auth_request(ticket, key, auth)
    }

    fn encode_envelope(
        &self,
        token: &MechToken
    ) -> Result<Vec<u8>, EnvelopeError> {
        let mech_token = self.inner.encode_envelope(token)?;

        encode_neg_token_init(token.mech(), mech_token)
    }

    fn decode_envelope(
        &self,
        buf: &[u8]
    ) -> Result<MechToken, EnvelopeError> {
        if buf.first() == Some(&TAG_NEG_TOKEN_RESP) {
            let token = decode_neg_token_resp(buf)?;

            self.inner.decode_envelope(token)
        } else {
            self.inner.decode_envelope(buf)
        }
    }

    #[inline]
    fn is_auth_reply(
        &self,
        token: &MechToken
    ) -> bool {
        self.inner.is_auth_reply(token)
    }
}

#[cfg(test)]
use std::convert::Infallible;

#[cfg(test)]
use crate::token::TokenKind;

#[cfg(test)]
struct PlainCodec;

#[cfg(test)]
impl TokenCodec for PlainCodec {
    type Error = Infallible;
    type Ticket = ();

    fn build_auth_request(
        &self,
        _ticket: &(),
        _key: &SessionKey,
        _auth: &Authenticator
    ) -> Result<Vec<u8>, Infallible> {
        Ok(vec![0x6e, 0x00])
    }
}

#[cfg(test)]
pub(crate) fn neg_token_resp(
    state: u8,
    token: Option<&[u8]>
) -> Vec<u8> {
    let state =
        tagged(Class::Universal, false, Tag::Enumerated, vec![state]).unwrap();
    let mut fields =
        tagged(Class::ContextSpecific, true, Tag(0), state).unwrap();

    if let Some(token) = token {
        let token =
            tagged(Class::Universal, false, Tag::OctetString, token.to_vec())
                .unwrap();

        fields
            .extend(tagged(Class::ContextSpecific, true, Tag(2), token).unwrap());
    }

    let resp = tagged(Class::Universal, true, Tag::Sequence, fields).unwrap();

    tagged(Class::ContextSpecific, true, Tag(1), resp).unwrap()
}

#[test]
fn test_encode_neg_token_init() {
    let codec = SPNEGOCodec::new(PlainCodec);
    let token = MechToken::krb5(TokenKind::ApReq, vec![0x6e, 0x00]);
    let krb5 = token.encode().unwrap();
    let buf = codec.encode_envelope(&token).unwrap();
    let (rest, outer) = Any::from_der(&buf).unwrap();

    assert!(rest.is_empty());
    assert_eq!(Class::Application, outer.header.class());
    assert_eq!(Tag(0), outer.header.tag());

    let (init, mech) = Oid::from_der(outer.data).unwrap();

    assert_eq!(SPNEGO_MECH_OID, mech);
    assert_eq!(0xa0, init[0]);
    assert!(buf.ends_with(&krb5));
}

#[test]
fn test_encode_offers_krb5_only() {
    let codec = SPNEGOCodec::new(PlainCodec);
    let token = MechToken::krb5(TokenKind::ApReq, vec![0x6e, 0x00]);
    let buf = codec.encode_envelope(&token).unwrap();
    let krb5_oid = crate::token::KRB5_MECH_OID.to_der_vec().unwrap();
    let mut mech_types = vec![0xa0, krb5_oid.len() as u8 + 2, 0x30];

    mech_types.push(krb5_oid.len() as u8);
    mech_types.extend(krb5_oid);

    assert!(buf
        .windows(mech_types.len())
        .any(|window| window == &mech_types[..]));
}

#[test]
fn test_decode_neg_token_resp() {
    let codec = SPNEGOCodec::new(PlainCodec);
    let reply = MechToken::krb5(TokenKind::ApRep, vec![0x6f, 0x00])
        .encode()
        .unwrap();
    let buf = neg_token_resp(0, Some(&reply));
    let token = codec.decode_envelope(&buf).unwrap();

    assert_eq!(TokenKind::ApRep, token.kind());
    assert!(codec.is_auth_reply(&token));
}

#[test]
fn test_decode_bare_token() {
    let codec = SPNEGOCodec::new(PlainCodec);
    let reply = MechToken::krb5(TokenKind::ApRep, vec![0x6f, 0x00])
        .encode()
        .unwrap();
    let token = codec.decode_envelope(&reply).unwrap();

    assert!(codec.is_auth_reply(&token));
}

#[test]
fn test_decode_rejected() {
    let codec = SPNEGOCodec::new(PlainCodec);
    let buf = neg_token_resp(NEG_STATE_REJECT as u8, None);

    assert_eq!(Err(EnvelopeError::Rejected), codec.decode_envelope(&buf));
}

#[test]
fn test_decode_missing_response_token() {
    let codec = SPNEGOCodec::new(PlainCodec);
    let buf = neg_token_resp(1, None);

    assert_eq!(Err(EnvelopeError::Malformed), codec.decode_envelope(&buf));
}
