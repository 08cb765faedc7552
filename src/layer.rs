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

//! Per-message security layers.
//!
//! Once a session is authenticated, a [SecurityLayer] can protect
//! each message exchanged over it.  The session takes care of
//! sequence numbering and buffer framing; the layer only supplies
//! the cryptographic wrap and unwrap operations, keyed by the
//! negotiated session key.
//!
//! A session created without a layer passes bytes through
//! unmodified, and provides neither integrity nor confidentiality.
use std::convert::Infallible;
use std::error::Error;

use crate::krb5::SessionKey;

/// Cryptographic message protection.
pub trait SecurityLayer {
    /// Errors that can occur wrapping or unwrapping.
    type Error: Error + Send + Sync + 'static;

    /// Largest number of bytes [wrap](SecurityLayer::wrap) adds to a
    /// message.
    #[inline]
    fn overhead(&self) -> usize {
        0
    }

    /// Protect `msg` under `key`.
    fn wrap(
        &mut self,
        key: &SessionKey,
        msg: &[u8]
    ) -> Result<Vec<u8>, Self::Error>;

    /// Verify and recover a message protected under `key`.
    ///
    /// This must fail if the token was not produced by the peer's
    /// [wrap](SecurityLayer::wrap) under the same key.
    fn unwrap(
        &mut self,
        key: &SessionKey,
        token: &[u8]
    ) -> Result<Vec<u8>, Self::Error>;
}

/// Placeholder layer type for sessions without message protection.
///
/// This type has no values.
#[derive(Debug)]
pub enum Unprotected {}

impl SecurityLayer for Unprotected {
    type Error = Infallible;

    #[inline]
    fn wrap(
        &mut self,
        _key: &SessionKey,
        _msg: &[u8]
    ) -> Result<Vec<u8>, Infallible> {
        match *self {}
    }

    #[inline]
    fn unwrap(
        &mut self,
        _key: &SessionKey,
        _token: &[u8]
    ) -> Result<Vec<u8>, Infallible> {
        match *self {}
    }
}
