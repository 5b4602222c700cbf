//! Inbound ESMTP engine.
//!
//! One process per session: the supervisor (tcpserver or friends) hands us
//! the socket on stdin/stdout together with `TCP6REMOTEIP` and its
//! siblings in the environment. The session state machine accepts mail,
//! runs the per-recipient policy pipeline, and hands accepted messages to
//! the queue child.

use std::pin::Pin;

use futures::io::{AsyncRead, AsyncWrite};

pub mod addrparse;
pub mod auth;
pub mod cdb;
pub mod config;
pub mod data;
pub mod filters;
pub mod queue;
pub mod session;
pub mod spf;
pub mod tls;
pub mod userconf;
pub mod vpop;
pub mod xmit;

/// The session stream: cleartext at first, swapped for the TLS stream on
/// STARTTLS.
pub type DynAsyncReadWrite =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

pub const VERSION_STRING: &str = concat!("postern-smtpd ", env!("CARGO_PKG_VERSION"));
