//! The outbound SMTP session: greeting, feature negotiation, STARTTLS,
//! MAIL/RCPT (pipelined when offered), DATA or BDAT, and the status
//! records back to the spooler.

use std::{io::Write, time::Duration};

use bitflags::bitflags;
use futures::io::AsyncReadExt;
use smtp_wire::{escape_message, normalize_crlf, parse_reply_line, scan_8bit, NetIo};
use tracing::{trace, warn};

use crate::{
    status::{overall_letter, recipient_letter, write_record},
    DynAsyncReadWrite, TransportError,
};

bitflags! {
    /// What the peer advertised in its EHLO reply.
    pub struct Extensions: u8 {
        const SIZE        = 0x01;
        const PIPELINING  = 0x02;
        const STARTTLS    = 0x04;
        const EIGHTBITMIME = 0x08;
        const CHUNKING    = 0x10;
    }
}

/// One complete (possibly multiline) reply.
pub struct Reply {
    pub code: u16,
    /// The text of the final line, used in status records.
    pub text: String,
    /// All line texts, for EHLO keyword parsing.
    pub lines: Vec<String>,
}

pub struct Remote {
    io: NetIo<DynAsyncReadWrite>,
    pub ext: Extensions,
    /// SIZE argument announced by the peer, 0 when none.
    pub remote_max: u64,
}

/// What to do with the envelope and the spool.
pub struct MailParams<'a> {
    /// Envelope sender, empty for bounces.
    pub sender: &'a str,
    pub rcpts: &'a [String],
    pub message: &'a [u8],
    /// BDAT chunk size; CHUNKING is only used when nonzero.
    pub chunk_size: usize,
}

impl Remote {
    /// Consume the banner and negotiate EHLO (falling back to HELO on a
    /// permanent rejection). Errors here mean "try the next candidate".
    pub async fn handshake(
        io: DynAsyncReadWrite,
        timeout: Duration,
        helo: &str,
    ) -> Result<Remote, TransportError> {
        let mut remote = Remote {
            io: NetIo::new(io, timeout),
            ext: Extensions::empty(),
            remote_max: 0,
        };
        let banner = remote.read_reply().await?;
        if banner.code != 220 {
            remote.quit().await;
            return Err(TransportError::Died);
        }
        remote.greet(helo).await?;
        Ok(remote)
    }

    /// EHLO/HELO negotiation; resets and refills the extension mask.
    pub async fn greet(&mut self, helo: &str) -> Result<(), TransportError> {
        self.ext = Extensions::empty();
        self.remote_max = 0;
        self.command(&format!("EHLO {}", helo)).await?;
        let reply = self.read_reply().await?;
        if reply.code == 250 {
            self.parse_extensions(&reply);
            return Ok(());
        }
        if reply.code >= 500 {
            // ancient server: plain HELO, no extensions
            self.command(&format!("HELO {}", helo)).await?;
            let reply = self.read_reply().await?;
            if reply.code == 250 {
                return Ok(());
            }
        }
        self.quit().await;
        Err(TransportError::Died)
    }

    fn parse_extensions(&mut self, reply: &Reply) {
        for line in reply.lines.iter().skip(1) {
            let upper = line.to_ascii_uppercase();
            if let Some(arg) = upper.strip_prefix("SIZE") {
                let arg = arg.trim();
                if arg.is_empty() {
                    self.ext |= Extensions::SIZE;
                } else if let Ok(n) = arg.parse() {
                    self.ext |= Extensions::SIZE;
                    self.remote_max = n;
                } else {
                    warn!("syntax error in EHLO response \"SIZE\"");
                }
            } else if upper == "PIPELINING" {
                self.ext |= Extensions::PIPELINING;
            } else if upper == "STARTTLS" {
                self.ext |= Extensions::STARTTLS;
            } else if upper == "8BITMIME" {
                self.ext |= Extensions::EIGHTBITMIME;
            } else if upper == "CHUNKING" {
                self.ext |= Extensions::CHUNKING;
            }
        }
    }

    /// Upgrade to TLS and EHLO again.
    pub async fn starttls(
        &mut self,
        connector: &async_tls::TlsConnector,
        peer_name: &str,
        helo: &str,
    ) -> Result<(), TransportError> {
        self.command("STARTTLS").await?;
        let reply = self.read_reply().await?;
        if reply.code != 220 {
            // carry on in cleartext
            return Ok(());
        }
        let placeholder: DynAsyncReadWrite = duplexify::Duplex::new(
            Box::pin(futures::io::empty()),
            Box::pin(futures::io::sink()),
        );
        let cleartext = self.io.replace_stream(placeholder);
        let stream = connector
            .connect(peer_name, cleartext)
            .await
            .map_err(|_| TransportError::Tls)?;
        let (r, w) = stream.split();
        let tls: DynAsyncReadWrite = duplexify::Duplex::new(Box::pin(r), Box::pin(w));
        self.io.replace_stream(tls);

        self.greet(helo).await.map_err(|_| TransportError::EhloAfterTls)
    }

    async fn command(&mut self, cmd: &str) -> Result<(), TransportError> {
        trace!(command = cmd, "sending command");
        let mut buf = Vec::with_capacity(cmd.len() + 2);
        buf.extend_from_slice(cmd.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.io.write_line(&buf).await.map_err(TransportError::from)
    }

    /// Read one full reply; continuation lines must repeat the code.
    pub async fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let mut lines = Vec::new();
        loop {
            self.io.read_line().await?;
            let parsed = match parse_reply_line(self.io.line()) {
                None => return Err(TransportError::ReplySyntax),
                Some(p) => p,
            };
            let last = parsed.last;
            let code = parsed.code;
            lines.push(parsed.text.to_owned());
            if last {
                let text = format!(
                    "{} {}",
                    code,
                    lines.last().map(|s| s.as_str()).unwrap_or("")
                );
                return Ok(Reply { code, text, lines });
            }
        }
    }

    /// Politely close; replies no longer matter.
    pub async fn quit(&mut self) {
        if self.command("QUIT").await.is_ok() {
            let _ = self.read_reply().await;
        }
    }

    fn mail_command(&self, params: &MailParams<'_>) -> String {
        let mut cmd = format!("MAIL FROM:<{}>", params.sender);
        if self.ext.contains(Extensions::SIZE) {
            cmd.push_str(&format!(" SIZE={}", params.message.len()));
        }
        if self.ext.contains(Extensions::EIGHTBITMIME) {
            cmd.push_str(if scan_8bit(params.message) {
                " BODY=8BITMIME"
            } else {
                " BODY=7BIT"
            });
        }
        cmd
    }

    /// Run the envelope and the payload; per-hop results are written to
    /// `out` as they arrive. Returns whether any recipient was accepted
    /// and the message handed over.
    pub async fn send_mail(
        &mut self,
        params: &MailParams<'_>,
        rhost: &str,
        out: &mut dyn Write,
    ) -> Result<bool, TransportError> {
        let mail = self.mail_command(params);
        let mut any_rcpt = false;

        if self.ext.contains(Extensions::PIPELINING) {
            // one write for the whole envelope hides the network latency
            let mut burst = mail;
            burst.push_str("\r\n");
            for r in params.rcpts {
                burst.push_str(&format!("RCPT TO:<{}>\r\n", r));
            }
            self.io.write_line(burst.as_bytes()).await?;

            let reply = self.read_reply().await?;
            self.record_mail(&reply, rhost, out)?;
            if reply.code >= 300 {
                for _ in params.rcpts {
                    let _ = self.read_reply().await?;
                }
                self.quit().await;
                return Ok(false);
            }
            for _ in params.rcpts {
                let reply = self.read_reply().await?;
                write_record(out, recipient_letter(reply.code), &reply.text)
                    .map_err(|e| TransportError::Net(e.to_string()))?;
                if reply.code < 300 {
                    any_rcpt = true;
                }
            }
        } else {
            self.command(&mail).await?;
            let reply = self.read_reply().await?;
            self.record_mail(&reply, rhost, out)?;
            if reply.code >= 300 {
                self.quit().await;
                return Ok(false);
            }
            for r in params.rcpts {
                self.command(&format!("RCPT TO:<{}>", r)).await?;
                let reply = self.read_reply().await?;
                write_record(out, recipient_letter(reply.code), &reply.text)
                    .map_err(|e| TransportError::Net(e.to_string()))?;
                if reply.code < 300 {
                    any_rcpt = true;
                }
            }
        }

        if !any_rcpt {
            self.quit().await;
            return Ok(false);
        }

        let final_reply = if self.ext.contains(Extensions::CHUNKING) && params.chunk_size > 0 {
            self.send_bdat(params).await?
        } else {
            self.send_data(params).await?
        };
        write_record(out, overall_letter(final_reply.code), &final_reply.text)
            .map_err(|e| TransportError::Net(e.to_string()))?;
        let delivered = final_reply.code < 300;
        self.quit().await;
        Ok(delivered)
    }

    fn record_mail(
        &self,
        reply: &Reply,
        rhost: &str,
        out: &mut dyn Write,
    ) -> Result<(), TransportError> {
        let text = if reply.code >= 300 {
            format!("Connected to {} but sender was rejected: {}", rhost, reply.text)
        } else {
            reply.text.clone()
        };
        write_record(out, overall_letter(reply.code), &text)
            .map_err(|e| TransportError::Net(e.to_string()))
    }

    async fn send_data(&mut self, params: &MailParams<'_>) -> Result<Reply, TransportError> {
        self.command("DATA").await?;
        let reply = self.read_reply().await?;
        if reply.code != 354 {
            return Ok(reply);
        }
        let mut payload = Vec::with_capacity(params.message.len() + 16);
        escape_message(params.message, &mut payload);
        payload.extend_from_slice(b".\r\n");
        self.io.write_line(&payload).await?;
        self.read_reply().await
    }

    async fn send_bdat(&mut self, params: &MailParams<'_>) -> Result<Reply, TransportError> {
        let mut wire = Vec::with_capacity(params.message.len() + 2);
        normalize_crlf(params.message, &mut wire);

        let mut sent = 0;
        while sent < wire.len() {
            let end = (sent + params.chunk_size).min(wire.len());
            let chunk = &wire[sent..end];
            let last = end == wire.len();
            let header = if last {
                format!("BDAT {} LAST\r\n", chunk.len())
            } else {
                format!("BDAT {}\r\n", chunk.len())
            };
            let mut buf = Vec::with_capacity(header.len() + chunk.len());
            buf.extend_from_slice(header.as_bytes());
            buf.extend_from_slice(chunk);
            self.io.write_line(&buf).await?;
            let reply = self.read_reply().await?;
            if last || reply.code >= 300 {
                return Ok(reply);
            }
            sent = end;
        }
        // empty message: a single terminating chunk
        self.command("BDAT 0 LAST").await?;
        self.read_reply().await
    }
}
