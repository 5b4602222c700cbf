//! The DATA receiver.
//!
//! Streams dot-unstuffed, LF-terminated lines to the queue child while
//! enforcing the size bound, the strict RFC 2822 header rules, the hop
//! count, and `Delivered-To:` loop detection. A failed message is still
//! read to its end so the session returns to command state cleanly.

use smtp_wire::NetError;
use tracing::{error, info};

use crate::{
    queue::{reply_for_exit, write_envelope},
    session::{Flow, Session, SessionError},
    spf::received_spf,
    VERSION_STRING,
};

const MAX_HOPS: u32 = 100;

fn starts_ci(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

impl Session {
    pub(crate) async fn smtp_data(&mut self) -> Result<Flow, SessionError> {
        if self.goodrcpt == 0 {
            self.tarpit().await;
            self.reply("554 5.1.1 no valid recipients").await?;
            return Err(SessionError::Done);
        }
        // a peer that already sent the body didn't wait for our reply;
        // don't let its mail through
        if self.io.has_pending().await? {
            match self.io.read_line().await {
                Err(e) if e.is_fatal() => return Err(SessionError::Net(e)),
                _ => {}
            }
            self.reply("550 5.5.0 you must wait for my reply").await?;
            self.freedata();
            self.comstate = self.post_helo_state();
            return Err(SessionError::Bogus);
        }

        let mut handle = match self.deps.queue.begin().await {
            Err(e) => {
                error!("cannot start queue child: {}", e);
                self.reply("421 4.3.2 cannot connect to queue").await?;
                return Err(SessionError::Done);
            }
            Ok(h) => h,
        };
        self.reply("354 Start mail input; end with <CRLF>.<CRLF>").await?;

        let received = self.build_received();
        let mut write_err = handle.body(received.as_bytes()).await.err();

        let strict = self.xmit.strict_2822;
        let sevenbit = !self.xmit.body_8bit;
        let databytes = self.deps.cfg.databytes;
        let mut size = received.len() as u64;
        let mut in_header = true;
        let mut date_count = 0u32;
        let mut from_count = 0u32;
        let mut hop_count = 0u32;
        let mut failure: Option<String> = None;

        loop {
            let raw = match self.io.read_line().await {
                Ok(()) => self.io.line().to_vec(),
                Err(NetError::TooLong) => {
                    failure.get_or_insert_with(|| "500 5.5.2 line too long".to_owned());
                    continue;
                }
                Err(NetError::Stray) => {
                    failure.get_or_insert_with(|| "550 5.6.0 bare linebreak in message".to_owned());
                    continue;
                }
                Err(ne) => {
                    handle.abort().await;
                    return Err(SessionError::Net(ne));
                }
            };
            if raw == b"." {
                break;
            }
            if failure.is_some() {
                continue;
            }
            let content: &[u8] = if raw.first() == Some(&b'.') { &raw[1..] } else { &raw };

            size += content.len() as u64 + 1;
            if databytes > 0 && size > databytes {
                failure = Some("552 4.3.1 Too much mail data".to_owned());
                continue;
            }

            if in_header {
                if content.is_empty() {
                    in_header = false;
                    if let Some(f) = strict_header_verdict(strict, date_count, from_count) {
                        failure = Some(f);
                        continue;
                    }
                } else {
                    if strict && content.iter().any(|&b| b >= 0x80) {
                        failure = Some(
                            "550 5.6.0 message does not comply to RfC2822: \
                             8bit character in message header"
                                .to_owned(),
                        );
                        continue;
                    }
                    if starts_ci(content, b"date:") {
                        date_count += 1;
                    } else if starts_ci(content, b"from:") {
                        from_count += 1;
                    } else if starts_ci(content, b"received:") {
                        hop_count += 1;
                        if hop_count > MAX_HOPS {
                            failure =
                                Some("554 5.4.6 too many hops, this message is looping".to_owned());
                            continue;
                        }
                    }
                }
            } else if strict && sevenbit && content.iter().any(|&b| b >= 0x80) {
                failure = Some(
                    "550 5.6.0 message does not comply to RfC2822: \
                     8bit character in message body"
                        .to_owned(),
                );
                continue;
            }

            if starts_ci(content, b"delivered-to:") {
                let value = String::from_utf8_lossy(&content[b"delivered-to:".len()..]);
                let value = value.trim();
                if self
                    .recipients
                    .iter()
                    .any(|r| r.accepted && r.mailbox.eq_ignore_ascii_case(value))
                {
                    failure = Some(
                        "554 5.4.6 this message is looping: \
                         it already has my Delivered-To line"
                            .to_owned(),
                    );
                    continue;
                }
            }

            if write_err.is_none() {
                let mut chunk = Vec::with_capacity(content.len() + 1);
                chunk.extend_from_slice(content);
                chunk.push(b'\n');
                if let Err(e) = handle.body(&chunk).await {
                    write_err = Some(e);
                }
            }
        }

        if strict && in_header && failure.is_none() {
            failure = strict_header_verdict(strict, date_count, from_count);
        }

        if let Some(f) = failure {
            handle.abort().await;
            info!(
                "rejected message from <{}> from IP [{}] {{{}}}",
                self.xmit.sender_display(),
                self.xmit.remote_ip_str,
                f
            );
            self.tarpit().await;
            self.reply(&f).await?;
            self.freedata();
            self.comstate = self.post_helo_state();
            return Ok(Flow::Stay);
        }
        if let Some(e) = write_err {
            error!("error writing message to queue: {}", e);
            handle.abort().await;
            self.reply("451 4.3.2 connection to queue lost").await?;
            self.freedata();
            self.comstate = self.post_helo_state();
            return Ok(Flow::Stay);
        }

        let from = self.xmit.mail_from.as_ref().map(|m| m.address());
        let accepted: Vec<&str> = self
            .recipients
            .iter()
            .filter(|r| r.accepted)
            .map(|r| r.mailbox.as_str())
            .collect();
        let mut envelope = Vec::new();
        write_envelope(&mut envelope, from.as_deref(), &accepted);

        match handle.finish(&envelope).await {
            Err(e) => {
                error!("queue child failed: {}", e);
                self.reply("451 4.3.2 connection to queue lost").await?;
                self.freedata();
                self.comstate = self.post_helo_state();
                Ok(Flow::Stay)
            }
            Ok(0) => {
                info!(
                    "message queued: from <{}> to {} recipient(s), {} bytes",
                    self.xmit.sender_display(),
                    accepted.len(),
                    size
                );
                self.reply(reply_for_exit(0)).await?;
                self.freedata();
                Ok(Flow::Continue)
            }
            Ok(code) => {
                info!("queue child rejected message with exit code {}", code);
                self.reply(reply_for_exit(code)).await?;
                self.freedata();
                self.comstate = self.post_helo_state();
                Ok(Flow::Stay)
            }
        }
    }

    /// Our own Received line, plus Received-SPF when a verdict exists.
    fn build_received(&self) -> String {
        let helo = match self.xmit.helo_str() {
            "" => "unknown",
            h => h,
        };
        let rdns = self.xmit.remote_host.as_deref().unwrap_or("unknown");
        let first = self
            .recipients
            .iter()
            .find(|r| r.accepted)
            .map(|r| r.mailbox.as_str())
            .unwrap_or("unknown");

        let mut s = format!(
            "Received: from {} ({} [{}])\n",
            helo, rdns, self.xmit.remote_ip_str
        );
        s.push_str(&format!(
            "\tby {} ({}) with {}",
            self.deps.cfg.helo_name,
            VERSION_STRING,
            self.protocol_name()
        ));
        if let Some(a) = &self.xmit.auth_name {
            s.push_str(&format!(" (auth={})", a));
        }
        s.push('\n');
        s.push_str(&format!(
            "\tfor <{}>; {}\n",
            first,
            chrono::Utc::now().to_rfc2822()
        ));
        if let Some(spf) = &self.xmit.spf {
            s.push_str(&received_spf(spf, &self.deps.cfg.helo_name, &self.xmit.spf_domain()));
            s.push('\n');
        }
        s
    }
}

fn strict_header_verdict(strict: bool, date_count: u32, from_count: u32) -> Option<String> {
    if !strict {
        return None;
    }
    if date_count != 1 {
        return Some(
            "550 5.6.0 message does not comply to RfC2822: exactly one 'Date:' required".to_owned(),
        );
    }
    if from_count != 1 {
        return Some(
            "550 5.6.0 message does not comply to RfC2822: exactly one 'From:' required".to_owned(),
        );
    }
    None
}
