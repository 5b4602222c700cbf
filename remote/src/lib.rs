//! Outbound SMTP client for a qmail-style queue.
//!
//! The spooler hands us the message on fd 0 and the envelope on the
//! command line; per-hop results go back on fd 1 in the classic
//! single-letter status protocol.

use std::pin::Pin;

use futures::io::{AsyncRead, AsyncWrite};

pub mod conn;
pub mod session;
pub mod status;

pub type DynAsyncReadWrite =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

/// Fatal delivery problems. The rendered message is exactly the status
/// line the spooler expects, leading letter included.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Z4.4.3 cannot find a mail exchanger for {0}")]
    NoMx(String),

    #[error("Zcan't connect to any server")]
    NoConnection,

    #[error("Z4.3.0 parse error in first argument")]
    BadLiteral,

    #[error("Zsyntax error in server reply")]
    ReplySyntax,

    #[error("Zconnection to remote timed out")]
    TimedOut,

    #[error("Zconnection to remote server died")]
    Died,

    #[error("Z4.3.0 Configuration error.")]
    Config,

    #[error("ZEHLO failed after STARTTLS")]
    EhloAfterTls,

    #[error("ZTLS negotiation failed")]
    Tls,

    #[error("Z{0}")]
    Net(String),
}

impl From<smtp_wire::NetError> for TransportError {
    fn from(e: smtp_wire::NetError) -> TransportError {
        match e {
            smtp_wire::NetError::TimedOut => TransportError::TimedOut,
            smtp_wire::NetError::Closed => TransportError::Died,
            smtp_wire::NetError::TooLong | smtp_wire::NetError::Stray => TransportError::ReplySyntax,
            smtp_wire::NetError::Io(e) => TransportError::Net(e.to_string()),
        }
    }
}
