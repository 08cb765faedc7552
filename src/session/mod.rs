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

//! SASL `GSSAPI` sessions.
//!
//! A [SASLSession] takes exclusive ownership of a byte stream,
//! performs a single-round Kerberos authentication over it with
//! [connect](SASLSession::connect), and then acts as a [Read] and
//! [Write] channel for the application protocol.
//!
//! # Negotiation
//!
//! Negotiation moves through the states of [SessionState]:
//!
//! ```text
//! Unauthenticated --> RequestSent --> Authenticated
//!        |                 |
//!        +-----------------+--------> Failed
//! ```
//!
//! Exactly one write and one read are issued against the stream
//! during [connect](SASLSession::connect).  The handshake is never
//! retried: an authenticator cannot safely be replayed.  After a
//! failure, [into_inner](SASLSession::into_inner) recovers the
//! stream; the session itself never closes it.
//!
//! There are no timeouts; deadlines must be set on the stream
//! itself.
//!
//! # Message Protection
//!
//! A session created with [new](SASLSession::new) passes bytes
//! through unmodified once authenticated, and provides no integrity
//! or confidentiality of its own.
//!
//! A session created with [with_layer](SASLSession::with_layer)
//! protects every message with its [SecurityLayer].  Each message is
//! prefixed with a four-byte big-endian sequence number, wrapped, and
//! sent as a four-byte big-endian length followed by the wrapped
//! token.  Sequence numbers start at zero in both directions and
//! increase by one per message.  Any inbound message that fails to
//! unwrap or carries the wrong sequence number fails the session.
//!
//! The layer is keyed with the subkey carried in the authenticator
//! (RFC 4121 §2), not with the ticket's session key.
use std::cmp::min;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use log::debug;
use log::info;
use log::trace;
use log::warn;
use openssl::rand::rand_bytes;

use crate::config::SASLConfig;
use crate::framer::Framer;
use crate::krb5::Authenticator;
use crate::krb5::SessionKey;
use crate::krb5::TicketProvider;
use crate::layer::SecurityLayer;
use crate::layer::Unprotected;
use crate::session::error::EncodingError;
use crate::session::error::IntegrityError;
use crate::session::error::ProtocolError;
use crate::session::error::SASLError;
use crate::session::error::TransportError;
use crate::token::MechToken;
use crate::token::TokenCodec;
use crate::token::TokenKind;

pub mod error;
#[cfg(test)]
mod mock;

/// Size of the buffer length prefix.
const LEN_PREFIX: usize = 4;
/// Size of the sequence number prefix inside a wrapped message.
const SEQ_PREFIX: usize = 4;
/// Chunk size for [recv](SASLSession::recv) without a security layer.
const PASSTHROUGH_CHUNK: usize = 16384;

/// Negotiation states.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SessionState {
    /// Bound to a stream, nothing sent.
    Unauthenticated,
    /// Authentication request written, reply not yet verified.
    RequestSent,
    /// Reply verified; the session is usable.
    Authenticated,
    /// Negotiation or message protection failed.
    Failed
}

/// A SASL `GSSAPI` session over `Stream`.
///
/// See the [module documentation](crate::session) for details.
pub struct SASLSession<Stream, Layer = Unprotected> {
    /// The underlying stream.
    stream: Stream,
    /// Message protection, if any.
    layer: Option<Layer>,
    config: SASLConfig,
    state: SessionState,
    /// Session key, set once authenticated.
    key: Option<SessionKey>,
    /// Authenticator subkey keying the layer, set once authenticated.
    subkey: Option<SessionKey>,
    /// Next outbound sequence number.
    txseq: u64,
    /// Next expected inbound sequence number.
    rxseq: u64,
    /// Unwrapped inbound payload not yet read.
    pending: Vec<u8>,
    /// Read position in `pending`.
    pending_pos: usize
}

fn random_bytes(len: usize) -> Result<Vec<u8>, SASLError> {
    let mut buf = vec![0; len];

    rand_bytes(&mut buf).map_err(|err| {
        SASLError::encoding(EncodingError::Random { error: err })
    })?;

    Ok(buf)
}

fn wrap_message<Layer>(
    layer: &mut Layer,
    key: &SessionKey,
    seq: u32,
    payload: &[u8]
) -> Result<Vec<u8>, IntegrityError>
where
    Layer: SecurityLayer {
    let mut msg = Vec::with_capacity(payload.len() + SEQ_PREFIX);

    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);

    layer.wrap(key, &msg).map_err(|err| IntegrityError::Layer {
        error: Box::new(err)
    })
}

fn unwrap_message<Layer>(
    layer: &mut Layer,
    key: &SessionKey,
    token: &[u8]
) -> Result<(u32, Vec<u8>), IntegrityError>
where
    Layer: SecurityLayer {
    let mut msg = layer.unwrap(key, token).map_err(|err| {
        IntegrityError::Layer {
            error: Box::new(err)
        }
    })?;

    if msg.len() < SEQ_PREFIX {
        return Err(IntegrityError::Truncated);
    }

    let seq = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);

    msg.drain(..SEQ_PREFIX);

    Ok((seq, msg))
}

/// Read a length prefix, returning `None` on a clean end of stream.
fn read_len_prefix<R>(stream: &mut R) -> Result<Option<usize>, Error>
where
    R: Read {
    let mut buf = [0; LEN_PREFIX];
    let mut nread = 0;

    while nread < LEN_PREFIX {
        match stream.read(&mut buf[nread..]) {
            Ok(0) if nread == 0 => return Ok(None),
            Ok(0) => return Err(Error::from(ErrorKind::UnexpectedEof)),
            Ok(n) => nread += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err)
        }
    }

    Ok(Some(u32::from_be_bytes(buf) as usize))
}

impl<Stream> SASLSession<Stream, Unprotected>
where
    Stream: Read + Write
{
    /// Create a session without message protection.
    #[inline]
    pub fn new(
        stream: Stream,
        config: SASLConfig
    ) -> Self {
        SASLSession::create(stream, config, None)
    }
}

impl<Stream, Layer> SASLSession<Stream, Layer>
where
    Stream: Read + Write,
    Layer: SecurityLayer
{
    #[inline]
    fn create(
        stream: Stream,
        config: SASLConfig,
        layer: Option<Layer>
    ) -> Self {
        SASLSession {
            stream: stream,
            layer: layer,
            config: config,
            state: SessionState::Unauthenticated,
            key: None,
            subkey: None,
            txseq: 0,
            rxseq: 0,
            pending: Vec::new(),
            pending_pos: 0
        }
    }

    /// Create a session that protects messages with `layer` once
    /// authenticated.
    #[inline]
    pub fn with_layer(
        stream: Stream,
        config: SASLConfig,
        layer: Layer
    ) -> Self {
        SASLSession::create(stream, config, Some(layer))
    }

    /// Get the negotiation state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Whether messages are protected by a security layer.
    #[inline]
    pub fn is_protected(&self) -> bool {
        self.layer.is_some()
    }

    #[inline]
    pub fn config(&self) -> &SASLConfig {
        &self.config
    }

    /// Get the session key, once authenticated.
    #[inline]
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Get the subkey sent in the authenticator, once authenticated.
    ///
    /// Protected messages are wrapped with this key.
    #[inline]
    pub fn subkey(&self) -> Option<&SessionKey> {
        self.subkey.as_ref()
    }

    /// Get the sequence number of the next outbound message.
    #[inline]
    pub fn send_seq(&self) -> u64 {
        self.txseq
    }

    /// Get the sequence number expected on the next inbound message.
    #[inline]
    pub fn recv_seq(&self) -> u64 {
        self.rxseq
    }

    /// Get a reference to the underlying stream.
    #[inline]
    pub fn get_ref(&self) -> &Stream {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream.
    ///
    /// Reading or writing the stream directly will corrupt protected
    /// traffic.
    #[inline]
    pub fn get_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    /// Give up the session and recover the underlying stream.
    #[inline]
    pub fn into_inner(self) -> Stream {
        self.stream
    }

    /// Mark the session failed and pass `err` along.
    fn fail(
        &mut self,
        err: SASLError
    ) -> SASLError {
        warn!(target: "sasl-session",
              "session failed in state {:?} ({})",
              self.state, err);

        self.state = SessionState::Failed;

        err
    }

    /// Check that the session can carry application data.
    fn check_live(&self) -> Result<(), SASLError> {
        match self.state {
            SessionState::Authenticated => Ok(()),
            SessionState::Failed => {
                Err(SASLError::protocol(ProtocolError::SessionFailed))
            }
            _ => Err(SASLError::protocol(ProtocolError::NotAuthenticated))
        }
    }

    /// Largest payload that fits in one protected buffer.
    #[inline]
    fn max_payload(&self) -> usize {
        let overhead = self.layer.as_ref().map_or(0, |layer| layer.overhead());

        self.config
            .max_message_size()
            .saturating_sub(LEN_PREFIX + SEQ_PREFIX + overhead)
    }

    /// Build the framed authentication request, returning it along
    /// with the authenticator subkey.
    fn build_request<F, C>(
        &self,
        framer: &F,
        codec: &C,
        ticket: &C::Ticket,
        key: &SessionKey
    ) -> Result<(Vec<u8>, SessionKey), SASLError>
    where
        F: Framer,
        C: TokenCodec {
        let enctype = key.enctype().ok_or_else(|| {
            SASLError::encoding(EncodingError::UnsupportedEncType {
                enctype: key.enctype_number()
            })
        })?;

        if enctype.is_weak() && !self.config.allow_weak_enctypes() {
            return Err(SASLError::encoding(EncodingError::WeakEncType {
                enctype: enctype
            }));
        }

        trace!(target: "sasl-session",
               "generating {} byte subkey for {}",
               enctype.key_size(), enctype);

        let subkey =
            SessionKey::new(enctype.number(), random_bytes(enctype.key_size())?);
        let seq = random_bytes(4)?;
        let seq = u32::from_be_bytes([seq[0], seq[1], seq[2], seq[3]]);
        let auth = Authenticator::new(
            self.config.flags(),
            subkey.clone(),
            seq & 0x3fff_ffff
        );
        let apreq = codec
            .build_auth_request(ticket, key, &auth)
            .map_err(|err| {
                SASLError::encoding(EncodingError::Codec {
                    error: Box::new(err)
                })
            })?;
        let token = MechToken::krb5(TokenKind::ApReq, apreq);
        let envelope = codec.encode_envelope(&token).map_err(|err| {
            SASLError::encoding(EncodingError::Envelope { error: err })
        })?;

        let msg = framer.frame(&envelope).map_err(|err| {
            SASLError::encoding(EncodingError::Framing { error: err })
        })?;

        Ok((msg, subkey))
    }

    /// Authenticate to `service`.
    ///
    /// This obtains a ticket from `provider`, sends an authentication
    /// request built by `codec` and framed by `framer`, and verifies
    /// that the peer answers with an authentication reply.
    ///
    /// Only an unauthenticated session can connect; calling this on
    /// an authenticated or failed session is an error and has no
    /// effect.  Any other failure leaves the session
    /// [Failed](SessionState::Failed).  A ticket error occurs before
    /// any IO on the stream.
    pub fn connect<F, P, C>(
        &mut self,
        framer: &F,
        service: &str,
        provider: &mut P,
        codec: &C
    ) -> Result<(), SASLError>
    where
        F: Framer,
        P: TicketProvider,
        C: TokenCodec<Ticket = P::Ticket> {
        match self.state {
            SessionState::Unauthenticated => {}
            SessionState::Authenticated => {
                return Err(SASLError::protocol(
                    ProtocolError::AlreadyAuthenticated
                ))
            }
            SessionState::RequestSent | SessionState::Failed => {
                return Err(SASLError::protocol(ProtocolError::SessionFailed))
            }
        }

        debug!(target: "sasl-session",
               "requesting service ticket for {}",
               service);

        let (ticket, key) = provider.service_ticket(service).map_err(|err| {
            self.fail(SASLError::Ticket {
                error: Box::new(err)
            })
        })?;
        let (msg, subkey) =
            match self.build_request(framer, codec, &ticket, &key) {
                Ok(req) => req,
                Err(err) => return Err(self.fail(err))
            };

        trace!(target: "sasl-session",
               "sending {} byte authentication request",
               msg.len());

        let written = self
            .stream
            .write(&msg)
            .map_err(|err| self.fail(SASLError::io(err)))?;

        if written != msg.len() {
            return Err(self.fail(SASLError::Transport {
                error: TransportError::ShortWrite {
                    written: written,
                    len: msg.len()
                }
            }));
        }

        self.stream
            .flush()
            .map_err(|err| self.fail(SASLError::io(err)))?;
        self.state = SessionState::RequestSent;

        let mut buf = vec![0; self.config.max_negotiate_size()];
        let nread = loop {
            match self.stream.read(&mut buf) {
                Ok(nread) => break nread,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(self.fail(SASLError::io(err)))
            }
        };

        if nread == 0 {
            return Err(self.fail(SASLError::Transport {
                error: TransportError::Closed
            }));
        }

        buf.truncate(nread);

        trace!(target: "sasl-session",
               "received {} byte response",
               nread);

        let token = framer.unframe(&buf).map_err(|err| {
            self.fail(SASLError::protocol(ProtocolError::Framing {
                error: err
            }))
        })?;
        let reply = codec.decode_envelope(&token).map_err(|err| {
            self.fail(SASLError::protocol(ProtocolError::Envelope {
                error: err
            }))
        })?;

        if !codec.is_auth_reply(&reply) {
            return Err(self.fail(SASLError::protocol(
                ProtocolError::NotAuthReply { kind: reply.kind() }
            )));
        }

        self.key = Some(key);
        self.subkey = Some(subkey);
        self.txseq = 0;
        self.rxseq = 0;
        self.state = SessionState::Authenticated;

        info!(target: "sasl-session",
              "authenticated to {}{}",
              service,
              if self.layer.is_some() { " with message protection" }
              else { "" });

        Ok(())
    }

    /// Send one application message.
    ///
    /// Without a security layer, this writes `msg` to the stream
    /// unmodified.  With one, `msg` is sent as a single protected
    /// buffer, and must fit in the configured maximum message size.
    pub fn send(
        &mut self,
        msg: &[u8]
    ) -> Result<(), SASLError> {
        self.check_live()?;

        if self.layer.is_none() {
            return self.stream.write_all(msg).map_err(SASLError::io);
        }

        let max = self.max_payload();

        if msg.len() > max {
            return Err(SASLError::protocol(ProtocolError::MessageTooLarge {
                len: msg.len(),
                max: max
            }));
        }

        if self.txseq > u32::MAX as u64 {
            return Err(self.fail(SASLError::integrity(
                IntegrityError::SequenceExhausted
            )));
        }

        let seq = self.txseq as u32;
        let wrapped = match (self.layer.as_mut(), self.subkey.as_ref()) {
            (Some(layer), Some(key)) => wrap_message(layer, key, seq, msg)
                .map_err(SASLError::integrity),
            _ => Err(SASLError::protocol(ProtocolError::NotAuthenticated))
        };
        let token = wrapped.map_err(|err| self.fail(err))?;

        if token.len() > self.config.max_message_size() {
            return Err(self.fail(SASLError::integrity(
                IntegrityError::Oversize {
                    len: token.len(),
                    max: self.config.max_message_size()
                }
            )));
        }

        let mut buf = Vec::with_capacity(token.len() + LEN_PREFIX);

        buf.extend_from_slice(&(token.len() as u32).to_be_bytes());
        buf.extend_from_slice(&token);

        trace!(target: "sasl-session",
               "sending protected message {} ({} bytes)",
               seq, msg.len());

        self.stream
            .write_all(&buf)
            .map_err(|err| self.fail(SASLError::io(err)))?;
        self.txseq += 1;

        Ok(())
    }

    /// Receive one application message.
    ///
    /// Without a security layer, this returns whatever the stream
    /// yields from a single read, with an empty message indicating
    /// the end of the stream.  With one, this returns the payload of
    /// the next protected buffer.
    pub fn recv(&mut self) -> Result<Vec<u8>, SASLError> {
        self.check_live()?;

        if self.layer.is_none() {
            let mut buf = vec![0; PASSTHROUGH_CHUNK];
            let nread = self.stream.read(&mut buf).map_err(SASLError::io)?;

            buf.truncate(nread);

            return Ok(buf);
        }

        let len = match read_len_prefix(&mut self.stream) {
            Ok(Some(len)) => len,
            Ok(None) => {
                return Err(SASLError::Transport {
                    error: TransportError::Closed
                })
            }
            Err(err) => return Err(self.fail(SASLError::io(err)))
        };
        let max = self.config.max_message_size();

        if len > max {
            return Err(self.fail(SASLError::integrity(
                IntegrityError::Oversize { len: len, max: max }
            )));
        }

        let mut token = vec![0; len];

        self.stream
            .read_exact(&mut token)
            .map_err(|err| self.fail(SASLError::io(err)))?;

        if self.rxseq > u32::MAX as u64 {
            return Err(self.fail(SASLError::integrity(
                IntegrityError::SequenceExhausted
            )));
        }

        let expected = self.rxseq as u32;
        let unwrapped = match (self.layer.as_mut(), self.subkey.as_ref()) {
            (Some(layer), Some(key)) => unwrap_message(layer, key, &token)
                .map_err(SASLError::integrity),
            _ => Err(SASLError::protocol(ProtocolError::NotAuthenticated))
        };
        let (seq, payload) = unwrapped.map_err(|err| self.fail(err))?;

        if seq != expected {
            return Err(self.fail(SASLError::integrity(
                IntegrityError::Sequence {
                    expected: expected,
                    actual: seq
                }
            )));
        }

        trace!(target: "sasl-session",
               "received protected message {} ({} bytes)",
               seq, payload.len());

        self.rxseq += 1;

        Ok(payload)
    }
}

impl<Stream, Layer> Read for SASLSession<Stream, Layer>
where
    Stream: Read + Write,
    Layer: SecurityLayer
{
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.check_live()?;

        if self.layer.is_none() {
            return self.stream.read(buf);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        // Skip over empty messages.
        while self.pending_pos >= self.pending.len() {
            match self.recv() {
                Ok(payload) => {
                    self.pending = payload;
                    self.pending_pos = 0;
                }
                Err(SASLError::Transport {
                    error: TransportError::Closed
                }) => return Ok(0),
                Err(err) => return Err(err.into())
            }
        }

        let len = min(buf.len(), self.pending.len() - self.pending_pos);
        let end = self.pending_pos + len;

        buf[..len].copy_from_slice(&self.pending[self.pending_pos..end]);
        self.pending_pos = end;

        Ok(len)
    }
}

impl<Stream, Layer> Write for SASLSession<Stream, Layer>
where
    Stream: Read + Write,
    Layer: SecurityLayer
{
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.check_live()?;

        if self.layer.is_none() {
            return self.stream.write(buf);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        let max = self.max_payload();

        if max == 0 {
            return Err(SASLError::protocol(ProtocolError::MessageTooLarge {
                len: buf.len(),
                max: max
            })
            .into());
        }

        let len = min(buf.len(), max);

        self.send(&buf[..len])?;

        Ok(len)
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush()
    }
}

#[cfg(test)]
use crate::framer::FramingError;
#[cfg(test)]
use crate::framer::IdentityFramer;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::ldap::bind_response;
#[cfg(test)]
use crate::ldap::LDAPBindFramer;
#[cfg(test)]
use crate::ldap::LDAP_SASL_BIND_IN_PROGRESS;
#[cfg(test)]
use crate::session::error::ErrorCategory;
#[cfg(test)]
use crate::session::mock::open_buffers;
#[cfg(test)]
use crate::session::mock::peer_buffer;
#[cfg(test)]
use crate::session::mock::Event;
#[cfg(test)]
use crate::session::mock::MockStream;
#[cfg(test)]
use crate::session::mock::StubCodec;
#[cfg(test)]
use crate::session::mock::StubProvider;
#[cfg(test)]
use crate::session::mock::XorLayer;
#[cfg(test)]
use crate::token::EnvelopeError;
#[cfg(test)]
use crate::spnego::neg_token_resp;
#[cfg(test)]
use crate::spnego::SPNEGOCodec;

#[cfg(test)]
const SERVICE: &str = "ldap/dc.example.com";

#[cfg(test)]
fn protected_session(
    config: SASLConfig
) -> SASLSession<MockStream, XorLayer> {
    let mut session =
        SASLSession::with_layer(MockStream::echo_peer(), config, XorLayer);
    let mut provider = StubProvider::new(18);

    session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect("expected success");

    session
}

#[cfg(test)]
struct BrokenFramer;

#[cfg(test)]
impl Framer for BrokenFramer {
    fn frame(
        &self,
        _token: &[u8]
    ) -> Result<Vec<u8>, FramingError> {
        Err(FramingError::Encoding {
            msg: String::from("no room")
        })
    }
}

#[cfg(test)]
fn reply_with(kind: TokenKind) -> MockStream {
    MockStream::with_responder(move |_| {
        Some(MechToken::krb5(kind, vec![0x6f, 0x00]).encode().unwrap())
    })
}

#[test]
fn test_connect_authenticates() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut provider = StubProvider::new(18);

    assert_eq!(SessionState::Unauthenticated, session.state());
    assert!(session.session_key().is_none());

    session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect("expected success");

    assert_eq!(SessionState::Authenticated, session.state());
    assert_eq!(&[Event::Write, Event::Read], session.get_ref().events());
    assert_eq!(1, provider.calls());
    assert_eq!(Some(18), session.session_key().map(|k| k.enctype_number()));
    assert_eq!(0, session.send_seq());
    assert_eq!(0, session.recv_seq());
}

#[test]
fn test_request_is_classified_as_request() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut provider = StubProvider::new(17);

    session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect("expected success");

    let sent = &session.get_ref().writes()[0];
    let unframed = IdentityFramer.unframe(sent).unwrap();
    let token = StubCodec.decode_envelope(&unframed).unwrap();

    assert!(token.is_krb5());
    assert_eq!(TokenKind::ApReq, token.kind());
    assert!(!StubCodec.is_auth_reply(&token));
    assert!(token.body().ends_with(SERVICE.as_bytes()));
}

#[test]
fn test_connect_rejects_request_reply() {
    init();

    let mut session =
        SASLSession::new(reply_with(TokenKind::ApReq), SASLConfig::default());
    let mut provider = StubProvider::new(18);
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert_eq!(ErrorCategory::Protocol, err.category());
    assert!(matches!(
        err,
        SASLError::Protocol {
            error: ProtocolError::NotAuthReply {
                kind: TokenKind::ApReq
            }
        }
    ));
    assert_eq!(SessionState::Failed, session.state());
    assert!(session.session_key().is_none());

    // The stream is handed back intact.
    let mut stream = session.into_inner();

    assert_eq!(&[Event::Write, Event::Read], stream.events());
    stream.write_all(&[0x01]).expect("expected success");
}

#[test]
fn test_connect_rejects_krb_error() {
    init();

    let mut session = SASLSession::new(
        reply_with(TokenKind::KrbError),
        SASLConfig::default()
    );
    let mut provider = StubProvider::new(18);
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Protocol {
            error: ProtocolError::NotAuthReply {
                kind: TokenKind::KrbError
            }
        }
    ));
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_connect_garbage_reply() {
    init();

    let stream = MockStream::with_responder(|_| Some(vec![0; 4096]));
    let mut session = SASLSession::new(stream, SASLConfig::default());
    let mut provider = StubProvider::new(18);
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Protocol {
            error: ProtocolError::Envelope {
                error: EnvelopeError::Malformed
            }
        }
    ));
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_connect_ticket_error_no_io() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut provider = StubProvider::failing();
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert_eq!(ErrorCategory::Credential, err.category());
    assert!(session.get_ref().events().is_empty());
    assert!(session.session_key().is_none());
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_connect_twice_rejected() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut provider = StubProvider::new(18);

    session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect("expected success");

    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Protocol {
            error: ProtocolError::AlreadyAuthenticated
        }
    ));
    assert_eq!(SessionState::Authenticated, session.state());
    assert_eq!(1, provider.calls());
    assert_eq!(2, session.get_ref().events().len());
}

#[test]
fn test_connect_after_failure_rejected() {
    init();

    let mut session =
        SASLSession::new(MockStream::new(), SASLConfig::default());
    let mut provider = StubProvider::failing();

    assert!(session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .is_err());

    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Protocol {
            error: ProtocolError::SessionFailed
        }
    ));
    assert_eq!(1, provider.calls());
}

#[test]
fn test_connect_short_write() {
    init();

    let stream = MockStream::echo_peer().with_write_limit(8);
    let mut session = SASLSession::new(stream, SASLConfig::default());
    let mut provider = StubProvider::new(18);
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Transport {
            error: TransportError::ShortWrite { written: 8, .. }
        }
    ));
    assert_eq!(&[Event::Write], session.get_ref().events());
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_connect_peer_closed() {
    init();

    let mut session =
        SASLSession::new(MockStream::new(), SASLConfig::default());
    let mut provider = StubProvider::new(18);
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Transport {
            error: TransportError::Closed
        }
    ));
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_connect_weak_enctype_refused() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut provider = StubProvider::new(23);
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Encoding {
            error: EncodingError::WeakEncType { .. }
        }
    ));
    assert!(session.get_ref().events().is_empty());
}

#[test]
fn test_connect_weak_enctype_allowed() {
    init();

    let config = SASLConfig::new(65536, 65536, true, true, true).unwrap();
    let mut session = SASLSession::new(MockStream::echo_peer(), config);
    let mut provider = StubProvider::new(23);

    session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect("expected success");

    assert!(session.is_authenticated());
}

#[test]
fn test_connect_unknown_enctype() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut provider = StubProvider::new(99);
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert_eq!(ErrorCategory::Encoding, err.category());
    assert!(matches!(
        err,
        SASLError::Encoding {
            error: EncodingError::UnsupportedEncType { enctype: 99 }
        }
    ));
}

#[test]
fn test_connect_over_ldap() {
    init();

    let framer = LDAPBindFramer::new(1, "");
    let stream = MockStream::with_responder(|_| {
        let reply = MechToken::krb5(TokenKind::ApRep, vec![0x6f, 0x00])
            .encode()
            .unwrap();

        Some(bind_response(
            1,
            LDAP_SASL_BIND_IN_PROGRESS,
            "",
            Some(&reply[..])
        ))
    });
    let mut session = SASLSession::new(stream, SASLConfig::default());
    let mut provider = StubProvider::new(18);

    session
        .connect(&framer, SERVICE, &mut provider, &StubCodec)
        .expect("expected success");

    assert!(session.is_authenticated());
    assert_eq!(0x30, session.get_ref().writes()[0][0]);
}

#[test]
fn test_connect_ldap_bind_rejected() {
    init();

    let framer = LDAPBindFramer::new(1, "");
    let stream = MockStream::with_responder(|_| {
        Some(bind_response(1, 49, "invalid credentials", None))
    });
    let mut session = SASLSession::new(stream, SASLConfig::default());
    let mut provider = StubProvider::new(18);
    let err = session
        .connect(&framer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Protocol {
            error: ProtocolError::Framing { .. }
        }
    ));
}

#[test]
fn test_io_before_authentication() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut buf = [0; 16];
    let err = session.read(&mut buf).expect_err("expected failure");

    assert_eq!(ErrorKind::Other, err.kind());
    assert!(matches!(
        session.send(&[0x01]),
        Err(SASLError::Protocol {
            error: ProtocolError::NotAuthenticated
        })
    ));
    assert!(session.get_ref().events().is_empty());
}

#[test]
fn test_passthrough() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut provider = StubProvider::new(18);

    session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect("expected success");
    session.write_all(&[0x01, 0x02, 0x03]).expect("expected success");
    session.get_mut().push_read(vec![0x04, 0x05]);

    let mut buf = [0; 2];

    session.read_exact(&mut buf).expect("expected success");

    assert!(!session.is_protected());
    assert_eq!(vec![0x01, 0x02, 0x03], session.get_ref().written_after(1));
    assert_eq!([0x04, 0x05], buf);
    assert_eq!(0, session.send_seq());
}

#[test]
fn test_protected_send_sequence() {
    init();

    let mut session = protected_session(SASLConfig::default());

    session.send(b"first").expect("expected success");
    session.send(b"second").expect("expected success");
    session.send(b"").expect("expected success");

    let key = session.subkey().unwrap().clone();
    let sent = open_buffers(&key, &session.get_ref().written_after(1));

    assert_eq!(
        vec![
            (0, b"first".to_vec()),
            (1, b"second".to_vec()),
            (2, Vec::new())
        ],
        sent
    );
    assert_eq!(3, session.send_seq());
}

#[test]
fn test_protected_recv_sequence() {
    init();

    let mut session = protected_session(SASLConfig::default());
    let key = session.subkey().unwrap().clone();

    session.get_mut().push_read(peer_buffer(&key, 0, b"one"));
    session.get_mut().push_read(peer_buffer(&key, 1, b"two"));

    assert_eq!(b"one".to_vec(), session.recv().expect("expected success"));
    assert_eq!(b"two".to_vec(), session.recv().expect("expected success"));
    assert_eq!(2, session.recv_seq());
}

#[test]
fn test_protected_rejects_skipped_sequence() {
    init();

    let mut session = protected_session(SASLConfig::default());
    let key = session.subkey().unwrap().clone();

    session.get_mut().push_read(peer_buffer(&key, 1, b"skip"));
    session.get_mut().push_read(peer_buffer(&key, 0, b"late"));

    let err = session.recv().expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Integrity {
            error: IntegrityError::Sequence {
                expected: 0,
                actual: 1
            }
        }
    ));
    assert_eq!(SessionState::Failed, session.state());

    // Nothing further is accepted, even a well-sequenced message.
    assert!(matches!(
        session.recv(),
        Err(SASLError::Protocol {
            error: ProtocolError::SessionFailed
        })
    ));
}

#[test]
fn test_protected_rejects_replay() {
    init();

    let mut session = protected_session(SASLConfig::default());
    let key = session.subkey().unwrap().clone();
    let first = peer_buffer(&key, 0, b"once");

    session.get_mut().push_read(first.clone());
    session.get_mut().push_read(first);

    assert_eq!(b"once".to_vec(), session.recv().expect("expected success"));
    assert!(matches!(
        session.recv(),
        Err(SASLError::Integrity {
            error: IntegrityError::Sequence {
                expected: 1,
                actual: 0
            }
        })
    ));
}

#[test]
fn test_protected_rejects_tampering() {
    init();

    let mut session = protected_session(SASLConfig::default());
    let key = session.subkey().unwrap().clone();
    let mut buf = peer_buffer(&key, 0, b"payload");
    let last = buf.len() - 1;

    buf[last] ^= 0x01;
    session.get_mut().push_read(buf);

    let err = session.recv().expect_err("expected failure");

    assert_eq!(ErrorCategory::Integrity, err.category());
    assert_eq!(SessionState::Failed, session.state());
    assert!(session.write(&[0x01]).is_err());
}

#[test]
fn test_protected_rejects_oversize() {
    init();

    let config = SASLConfig::new(65536, 64, true, true, false).unwrap();
    let mut session = protected_session(config);

    session.get_mut().push_read(vec![0x00, 0x01, 0x00, 0x00]);

    assert!(matches!(
        session.recv(),
        Err(SASLError::Integrity {
            error: IntegrityError::Oversize { len: 65536, max: 64 }
        })
    ));
}

#[test]
fn test_protected_send_too_large() {
    init();

    let config = SASLConfig::new(65536, 64, true, true, false).unwrap();
    let mut session = protected_session(config);

    assert!(matches!(
        session.send(&[0; 64]),
        Err(SASLError::Protocol {
            error: ProtocolError::MessageTooLarge { .. }
        })
    ));
    assert_eq!(SessionState::Authenticated, session.state());
    assert_eq!(0, session.send_seq());
}

#[test]
fn test_protected_write_splits() {
    init();

    let config = SASLConfig::new(65536, 64, true, true, false).unwrap();
    let mut session = protected_session(config);
    let data: Vec<u8> = (0..150).collect();

    session.write_all(&data).expect("expected success");

    let key = session.subkey().unwrap().clone();
    let sent = open_buffers(&key, &session.get_ref().written_after(1));
    let seqs: Vec<u32> = sent.iter().map(|(seq, _)| *seq).collect();
    let payload: Vec<u8> =
        sent.into_iter().flat_map(|(_, payload)| payload).collect();

    // 64 - 4 (length) - 4 (sequence) - 1 (layer) = 55 per buffer.
    assert_eq!(vec![0, 1, 2], seqs);
    assert_eq!(data, payload);
}

#[test]
fn test_protected_read_across_messages() {
    init();

    let mut session = protected_session(SASLConfig::default());
    let key = session.subkey().unwrap().clone();

    session.get_mut().push_read(peer_buffer(&key, 0, b"abc"));
    session.get_mut().push_read(peer_buffer(&key, 1, b""));
    session.get_mut().push_read(peer_buffer(&key, 2, b"defg"));

    let mut out = Vec::new();

    session.read_to_end(&mut out).expect("expected success");

    assert_eq!(b"abcdefg".to_vec(), out);
    assert_eq!(3, session.recv_seq());
    assert_eq!(SessionState::Authenticated, session.state());
}

#[test]
fn test_connect_framing_error_no_io() {
    init();

    let mut session =
        SASLSession::new(MockStream::echo_peer(), SASLConfig::default());
    let mut provider = StubProvider::new(18);
    let err = session
        .connect(&BrokenFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Encoding {
            error: EncodingError::Framing {
                error: FramingError::Encoding { .. }
            }
        }
    ));
    assert!(session.get_ref().events().is_empty());
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_connect_retries_interrupted_read() {
    init();

    let stream = MockStream::echo_peer().with_interrupts(2);
    let mut session = SASLSession::new(stream, SASLConfig::default());
    let mut provider = StubProvider::new(18);

    session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect("expected success");

    assert!(session.is_authenticated());
    assert_eq!(
        &[Event::Write, Event::Read, Event::Read, Event::Read],
        session.get_ref().events()
    );
}

#[test]
fn test_connect_reply_exceeds_negotiate_size() {
    init();

    let config = SASLConfig::new(16, 65536, true, true, false).unwrap();
    let stream = MockStream::with_responder(|_| {
        let mut body = vec![0x6f, 0x3e];

        body.resize(64, 0);

        Some(MechToken::krb5(TokenKind::ApRep, body).encode().unwrap())
    });
    let mut session = SASLSession::new(stream, config);
    let mut provider = StubProvider::new(18);
    let err = session
        .connect(&IdentityFramer, SERVICE, &mut provider, &StubCodec)
        .expect_err("expected failure");

    // Only the first 16 bytes are read, which do not hold a token.
    assert!(matches!(
        err,
        SASLError::Protocol {
            error: ProtocolError::Envelope { .. }
        }
    ));
    assert_eq!(&[Event::Write, Event::Read], session.get_ref().events());
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_connect_spnego() {
    init();

    let stream = MockStream::with_responder(|_| {
        let reply = MechToken::krb5(TokenKind::ApRep, vec![0x6f, 0x00])
            .encode()
            .unwrap();

        Some(neg_token_resp(0, Some(&reply)))
    });
    let mut session = SASLSession::new(stream, SASLConfig::default());
    let mut provider = StubProvider::new(18);
    let codec = SPNEGOCodec::new(StubCodec);

    session
        .connect(&IdentityFramer, SERVICE, &mut provider, &codec)
        .expect("expected success");

    let spnego_oid: [u8; 8] = [0x06, 0x06, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
    let sent = &session.get_ref().writes()[0];

    assert!(session.is_authenticated());
    assert_eq!(0x60, sent[0]);
    assert!(sent
        .windows(spnego_oid.len())
        .any(|window| window == &spnego_oid[..]));
}

#[test]
fn test_subkey_sent_in_authenticator() {
    init();

    let mut session = protected_session(SASLConfig::default());
    let subkey = session.subkey().unwrap().clone();
    let key = session.session_key().unwrap().clone();
    let sent = &session.get_ref().writes()[0];
    let token = StubCodec.decode_envelope(sent).unwrap();

    assert_eq!(18, subkey.enctype_number());
    assert_eq!(32, subkey.value().len());
    assert_ne!(key.value(), subkey.value());
    assert_eq!(subkey.value(), &token.body()[2..34]);

    session.send(b"keyed").expect("expected success");

    let sent = open_buffers(&subkey, &session.get_ref().written_after(1));

    assert_eq!(vec![(0, b"keyed".to_vec())], sent);
}

#[test]
fn test_protected_send_sequence_exhausted() {
    init();

    let mut session = protected_session(SASLConfig::default());
    let key = session.subkey().unwrap().clone();

    session.txseq = u32::MAX as u64;
    session.send(b"last").expect("expected success");

    let err = session.send(b"one too many").expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Integrity {
            error: IntegrityError::SequenceExhausted
        }
    ));
    assert_eq!(SessionState::Failed, session.state());
    assert_eq!(
        vec![(u32::MAX, b"last".to_vec())],
        open_buffers(&key, &session.get_ref().written_after(1))
    );
}

#[test]
fn test_protected_recv_sequence_exhausted() {
    init();

    let mut session = protected_session(SASLConfig::default());
    let key = session.subkey().unwrap().clone();

    session.rxseq = u32::MAX as u64;
    session.get_mut().push_read(peer_buffer(&key, u32::MAX, b"last"));
    session.get_mut().push_read(peer_buffer(&key, 0, b"wrapped"));

    assert_eq!(b"last".to_vec(), session.recv().expect("expected success"));
    assert!(matches!(
        session.recv(),
        Err(SASLError::Integrity {
            error: IntegrityError::SequenceExhausted
        })
    ));
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_protected_recv_truncated_buffer() {
    init();

    let mut session = protected_session(SASLConfig::default());

    session.get_mut().push_read(vec![0x00, 0x00, 0x00, 0x10, 0x01, 0x02]);

    let err = session.recv().expect_err("expected failure");

    assert_eq!(ErrorCategory::Transport, err.category());
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_protected_recv_truncated_length() {
    init();

    let mut session = protected_session(SASLConfig::default());

    session.get_mut().push_read(vec![0x00, 0x00]);

    let err = session.recv().expect_err("expected failure");

    assert!(matches!(
        err,
        SASLError::Transport {
            error: TransportError::IO { .. }
        }
    ));
    assert_eq!(SessionState::Failed, session.state());
}

#[test]
fn test_protected_recv_clean_close() {
    init();

    let mut session = protected_session(SASLConfig::default());

    assert!(matches!(
        session.recv(),
        Err(SASLError::Transport {
            error: TransportError::Closed
        })
    ));
    assert_eq!(SessionState::Authenticated, session.state());
}
