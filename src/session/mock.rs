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

//! Test doubles for sessions: an in-memory transport, a ticket
//! provider, a token codec, and a toy security layer.
use std::collections::VecDeque;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use crate::krb5::Authenticator;
use crate::krb5::SessionKey;
use crate::krb5::TicketProvider;
use crate::layer::SecurityLayer;
use crate::token::MechToken;
use crate::token::TokenCodec;
use crate::token::TokenKind;

/// IO operation observed on a [MockStream].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Event {
    Read,
    Write
}

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// In-memory transport that records every operation.
pub(crate) struct MockStream {
    events: Vec<Event>,
    writes: Vec<Vec<u8>>,
    reads: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    write_limit: Option<usize>,
    /// Reads left to fail with `Interrupted`.
    interrupts: usize
}

/// Ticket provider returning a fixed ticket and key.
pub(crate) struct StubProvider {
    enctype: i32,
    fail: bool,
    calls: usize
}

/// Token codec producing a fake `AP-REQ` from the subkey and ticket.
pub(crate) struct StubCodec;

/// Toy layer: XOR with the first key byte, prefixed by a checksum.
pub(crate) struct XorLayer;

impl MockStream {
    pub(crate) fn new() -> Self {
        MockStream {
            events: Vec::new(),
            writes: Vec::new(),
            reads: VecDeque::new(),
            responder: None,
            write_limit: None,
            interrupts: 0
        }
    }

    /// Peer that answers every `AP-REQ` with an `AP-REP`.
    pub(crate) fn echo_peer() -> Self {
        MockStream::with_responder(|msg| {
            let token = MechToken::decode(msg).ok()?;

            match token.kind() {
                TokenKind::ApReq => Some(
                    MechToken::krb5(TokenKind::ApRep, vec![0x6f, 0x02, 0, 0])
                        .encode()
                        .unwrap()
                ),
                _ => None
            }
        })
    }

    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
        let mut stream = MockStream::new();

        stream.responder = Some(Box::new(responder));

        stream
    }

    pub(crate) fn with_write_limit(
        mut self,
        limit: usize
    ) -> Self {
        self.write_limit = Some(limit);

        self
    }

    /// Fail the next `count` reads with `Interrupted`.
    pub(crate) fn with_interrupts(
        mut self,
        count: usize
    ) -> Self {
        self.interrupts = count;

        self
    }

    pub(crate) fn push_read(
        &mut self,
        data: Vec<u8>
    ) {
        self.reads.push_back(data)
    }

    pub(crate) fn events(&self) -> &[Event] {
        &self.events
    }

    pub(crate) fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// All bytes written since the first `skip` writes.
    pub(crate) fn written_after(
        &self,
        skip: usize
    ) -> Vec<u8> {
        self.writes[skip..].concat()
    }
}

impl Read for MockStream {
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.events.push(Event::Read);

        if self.interrupts > 0 {
            self.interrupts -= 1;

            return Err(Error::from(ErrorKind::Interrupted));
        }

        match self.reads.pop_front() {
            Some(data) => {
                let len = data.len().min(buf.len());

                buf[..len].copy_from_slice(&data[..len]);

                if len < data.len() {
                    self.reads.push_front(data[len..].to_vec());
                }

                Ok(len)
            }
            None => Ok(0)
        }
    }
}

impl Write for MockStream {
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.events.push(Event::Write);

        let len = match self.write_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len()
        };

        self.writes.push(buf[..len].to_vec());

        if let Some(responder) = self.responder.as_mut() {
            if let Some(resp) = responder(&buf[..len]) {
                self.reads.push_back(resp);
            }
        }

        Ok(len)
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl StubProvider {
    pub(crate) fn new(enctype: i32) -> Self {
        StubProvider {
            enctype: enctype,
            fail: false,
            calls: 0
        }
    }

    pub(crate) fn failing() -> Self {
        StubProvider {
            enctype: 18,
            fail: true,
            calls: 0
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls
    }
}

impl TicketProvider for StubProvider {
    type Error = Error;
    type Ticket = Vec<u8>;

    fn service_ticket(
        &mut self,
        service: &str
    ) -> Result<(Vec<u8>, SessionKey), Error> {
        self.calls += 1;

        if self.fail {
            Err(Error::new(ErrorKind::NotFound, "no credentials"))
        } else {
            Ok((
                service.as_bytes().to_vec(),
                SessionKey::new(self.enctype, vec![0x5a; 16])
            ))
        }
    }
}

impl TokenCodec for StubCodec {
    type Error = Error;
    type Ticket = Vec<u8>;

    fn build_auth_request(
        &self,
        ticket: &Vec<u8>,
        key: &SessionKey,
        auth: &Authenticator
    ) -> Result<Vec<u8>, Error> {
        let enctype = key
            .enctype()
            .ok_or_else(|| Error::from(ErrorKind::InvalidInput))?;

        if auth.subkey().value().len() != enctype.key_size() {
            return Err(Error::new(ErrorKind::InvalidInput, "bad subkey size"));
        }

        let mut out = vec![0x6e, ticket.len() as u8];

        out.extend_from_slice(auth.subkey().value());
        out.extend_from_slice(ticket);

        Ok(out)
    }
}

fn checksum(
    key: &SessionKey,
    msg: &[u8]
) -> u8 {
    key.value()
        .iter()
        .chain(msg.iter())
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl SecurityLayer for XorLayer {
    type Error = Error;

    fn overhead(&self) -> usize {
        1
    }

    fn wrap(
        &mut self,
        key: &SessionKey,
        msg: &[u8]
    ) -> Result<Vec<u8>, Error> {
        let pad = key.value()[0];
        let mut out = vec![checksum(key, msg)];

        out.extend(msg.iter().map(|b| b ^ pad));

        Ok(out)
    }

    fn unwrap(
        &mut self,
        key: &SessionKey,
        token: &[u8]
    ) -> Result<Vec<u8>, Error> {
        let (sum, body) = token
            .split_first()
            .ok_or_else(|| Error::from(ErrorKind::UnexpectedEof))?;
        let pad = key.value()[0];
        let msg: Vec<u8> = body.iter().map(|b| b ^ pad).collect();

        if checksum(key, &msg) == *sum {
            Ok(msg)
        } else {
            Err(Error::new(ErrorKind::InvalidData, "checksum mismatch"))
        }
    }
}

/// Build a protected buffer as the peer would send it.
pub(crate) fn peer_buffer(
    key: &SessionKey,
    seq: u32,
    payload: &[u8]
) -> Vec<u8> {
    let mut msg = seq.to_be_bytes().to_vec();

    msg.extend_from_slice(payload);

    let token = XorLayer.wrap(key, &msg).unwrap();
    let mut out = (token.len() as u32).to_be_bytes().to_vec();

    out.extend(token);

    out
}

/// Recover `(seq, payload)` pairs from protected buffers sent by a
/// session.
pub(crate) fn open_buffers(
    key: &SessionKey,
    mut buf: &[u8]
) -> Vec<(u32, Vec<u8>)> {
    let mut out = Vec::new();

    while !buf.is_empty() {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let msg = XorLayer.unwrap(key, &buf[4..4 + len]).unwrap();
        let seq = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);

        out.push((seq, msg[4..].to_vec()));
        buf = &buf[4 + len..];
    }

    out
}
