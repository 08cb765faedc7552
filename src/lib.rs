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

#![allow(clippy::redundant_field_names)]
#![allow(clippy::upper_case_acronyms)]

//! SASL `GSSAPI` (Kerberos V5) authentication for byte streams.
//!
//! This package wraps an arbitrary bidirectional byte stream in a
//! [SASLSession](session::SASLSession), which authenticates to a
//! service with a single Kerberos `AP-REQ`/`AP-REP` exchange and then
//! carries application traffic, optionally protected by a
//! [SecurityLayer](layer::SecurityLayer).
//!
//! Kerberos itself is kept behind two traits:
//!
//!  - [TicketProvider](krb5::TicketProvider) obtains a service ticket
//!    and session key, typically from a credential cache.
//!
//!  - [TokenCodec](token::TokenCodec) encodes the `AP-REQ` message
//!    and handles the `GSSAPI` token envelope around it.
//!
//! Outer protocols wrap negotiation tokens with a
//! [Framer](framer::Framer).  The [ldap] module provides one for LDAP
//! SASL binds.  Peers expecting `GSS-SPNEGO` rather than bare
//! Kerberos tokens can be reached through
//! [SPNEGOCodec](spnego::SPNEGOCodec).
//!
//! Session limits are configurable; [SASLConfig](config::SASLConfig)
//! can be parsed from YAML using `serde_yaml`.
pub mod config;
pub mod framer;
pub mod krb5;
pub mod layer;
pub mod ldap;
pub mod session;
pub mod spnego;
pub mod token;

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}
