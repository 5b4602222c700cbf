//! Wire-level SMTP: CRLF line framing with pushback, mailbox/path syntax,
//! reply parsing and classification, and DATA dot-(un)stuffing.
//!
//! Everything here is protocol-shaped and policy-free; the inbound and
//! outbound engines layer their semantics on top.

pub use nom;

mod address;
mod data;
mod netio;
mod reply;

pub use address::{domain_valid, parse_path, AddrError, Mailbox, Path};
pub use data::{escape_message, normalize_crlf, scan_8bit};
pub use netio::{NetError, NetIo, LINE_LIMIT, REPLY_LIMIT};
pub use reply::{parse_reply_line, ReplyKind, ReplyLine};
