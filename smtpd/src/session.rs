//! The inbound command state machine.
//!
//! One bit per command; a command may only run when its mask covers the
//! current state. Transitions mirror the classic table: HELO/EHLO/MAIL/
//! RCPT move to their own bit, RSET and DATA re-enter the matching
//! post-(E)HLO state. Five consecutive bad commands drop the
//! connection.

use std::{ffi::CString, net::Ipv6Addr, os::unix::ffi::OsStrExt, sync::Arc, time::Duration};

use futures::io::AsyncReadExt;
use smtp_dns::{ip4_matchnet, ip6_matchnet, mx_list, Dns};
use smtp_wire::{domain_valid, parse_path, NetError, NetIo, Path as MailPath, REPLY_LIMIT};
use tracing::{error, info, warn};

use crate::{
    addrparse::{resolve, AddrOutcome, UserExists, MAX_RCPT},
    config::{load_list, Config},
    filters::{run_filters, Filter, FilterCtx},
    queue::Queue,
    spf::SpfContext,
    tls::TlsParams,
    userconf::Userconf,
    xmit::{HeloInfo, MxResult, Recipient, Transmission, HELO_LITERAL_MISMATCH, HELO_NOFQDN, HELO_OURNAME},
    DynAsyncReadWrite, VERSION_STRING,
};

pub const MAX_BAD_CMDS: u32 = 5;

const STATE_INITIAL: u16 = 0x001;
const STATE_HELO: u16 = 0x008;
const STATE_MAIL: u16 = 0x020;
const STATE_DATA: u16 = 0x080;

const FLAG_ARGS: u8 = 1;
const FLAG_LONG: u8 = 2;

enum Next {
    Keep,
    SelfBit,
    Rset,
    Data,
}

struct CommandSpec {
    verb: &'static str,
    mask: u16,
    flags: u8,
    next: Next,
}

const COMMANDS: [CommandSpec; 11] = [
    CommandSpec { verb: "NOOP", mask: 0xffff, flags: 0, next: Next::Keep },
    CommandSpec { verb: "QUIT", mask: 0xfffd, flags: 0, next: Next::Keep },
    CommandSpec { verb: "RSET", mask: 0xfffd, flags: 0, next: Next::Rset },
    CommandSpec { verb: "HELO", mask: 0xfffd, flags: FLAG_ARGS, next: Next::SelfBit },
    CommandSpec { verb: "EHLO", mask: 0xfffd, flags: FLAG_ARGS, next: Next::SelfBit },
    CommandSpec { verb: "MAIL FROM:", mask: 0x0018, flags: FLAG_ARGS | FLAG_LONG, next: Next::SelfBit },
    CommandSpec { verb: "RCPT TO:", mask: 0x0060, flags: FLAG_ARGS, next: Next::SelfBit },
    CommandSpec { verb: "DATA", mask: 0x0040, flags: 0, next: Next::Data },
    CommandSpec { verb: "STARTTLS", mask: 0x0010, flags: 0, next: Next::Keep },
    CommandSpec { verb: "AUTH", mask: 0x0010, flags: FLAG_ARGS, next: Next::Keep },
    CommandSpec { verb: "VRFY", mask: 0xffff, flags: 0, next: Next::Keep },
];

/// Recoverable session errors, mapped to replies by the outer loop.
/// `Done` and `Bogus` mean a reply was already sent; `Done` also clears
/// the bad-command counter.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("command syntax error")]
    Syntax,

    #[error("unrecognized command parameter")]
    BadParameter,

    #[error("line too long")]
    TooBig,

    #[error("bad sequence of commands")]
    BadSequence,

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error")]
    Io,

    #[error("message exceeds the size limit")]
    MessageSize,

    #[error("queue filesystem is read only")]
    QueueReadOnly,

    #[error("unable to read control files")]
    Control,

    #[error("handled, reply already sent")]
    Done,

    #[error("rejected, reply already sent")]
    Bogus,

    #[error(transparent)]
    Net(#[from] NetError),
}

pub(crate) enum Flow {
    /// Apply the command's table transition.
    Continue,
    /// The handler managed the state itself.
    Stay,
    Quit,
}

enum ErrorFlow {
    Continue,
    Drop,
}

/// Everything a session needs besides the socket.
pub struct Deps {
    pub cfg: Arc<Config>,
    pub dns: Arc<dyn Dns>,
    pub backend: Arc<dyn crate::addrparse::UserBackend>,
    pub queue: Arc<dyn Queue>,
    pub tls: Option<TlsParams>,
}

pub struct Session {
    pub(crate) io: NetIo<DynAsyncReadWrite>,
    pub(crate) deps: Arc<Deps>,
    pub(crate) xmit: Transmission,
    pub(crate) recipients: Vec<Recipient>,
    pub(crate) comstate: u16,
    pub(crate) badcmds: u32,
    pub(crate) goodrcpt: u32,
    pub(crate) badbounce: bool,
    pub(crate) relay_client: Option<bool>,
    pub(crate) tls_active: bool,
    pub(crate) broken_setup: bool,
    send_banner: bool,
}

/// Run one inbound session to completion. The returned error is the
/// fatal network condition that ended it, if any.
pub async fn interact(
    io: DynAsyncReadWrite,
    deps: Arc<Deps>,
    xmit: Transmission,
    send_banner: bool,
    broken_setup: bool,
) -> Result<(), NetError> {
    let timeout = deps.cfg.timeout;
    let sess = Session {
        io: NetIo::new(io, timeout),
        deps,
        xmit,
        recipients: Vec::new(),
        comstate: STATE_INITIAL,
        badcmds: 0,
        goodrcpt: 0,
        badbounce: false,
        relay_client: None,
        tls_active: false,
        broken_setup,
        send_banner,
    };
    sess.run().await
}

impl Session {
    async fn run(mut self) -> Result<(), NetError> {
        if self.send_banner {
            self.banner().await?;
        }
        loop {
            let err = match self.io.read_line().await {
                Ok(()) => {
                    // no NUL and no 8-bit bytes in command lines
                    if self.io.line().iter().any(|&b| b == 0 || b >= 0x80) {
                        Some(SessionError::Syntax)
                    } else {
                        let line = String::from_utf8_lossy(self.io.line()).into_owned();
                        match self.dispatch(&line).await {
                            Ok(Flow::Quit) => return Ok(()),
                            Ok(_) => None,
                            Err(SessionError::Net(ne)) => return Err(ne),
                            Err(e) => Some(e),
                        }
                    }
                }
                Err(NetError::TooLong) => Some(SessionError::TooBig),
                Err(NetError::Stray) => Some(SessionError::Syntax),
                Err(ne) => return Err(ne),
            };
            if let Some(e) = err {
                match self.handle_error(e).await? {
                    ErrorFlow::Drop => return Ok(()),
                    ErrorFlow::Continue => {}
                }
            }
        }
    }

    async fn banner(&mut self) -> Result<(), NetError> {
        // a peer that talks before our greeting has a broken SMTP engine
        if self.io.has_pending().await? {
            match self.io.read_line().await {
                Err(e) if e.is_fatal() => return Err(e),
                _ => {}
            }
            self.say("550 5.5.0 you must wait for my reply").await?;
            self.badcmds = 1;
            return Ok(());
        }
        let me = self.deps.cfg.helo_name.clone();
        self.say(&format!("220 {} {} ESMTP", me, VERSION_STRING)).await
    }

    /// Reply helper for the error paths: only fatal errors escape.
    async fn say(&mut self, line: &str) -> Result<(), NetError> {
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.io.write_line(&buf).await
    }

    pub(crate) async fn reply(&mut self, line: &str) -> Result<(), SessionError> {
        self.say(line).await.map_err(SessionError::from)
    }

    pub(crate) async fn reply_parts(&mut self, parts: &[&str]) -> Result<(), SessionError> {
        self.io.write_multiline(parts).await.map_err(SessionError::from)
    }

    pub(crate) async fn tarpit(&self) {
        let d = self.deps.cfg.tarpit;
        if d > Duration::from_secs(0) {
            smol::Timer::after(d).await;
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<Flow, SessionError> {
        let upper = line.to_ascii_uppercase();
        let idx = match COMMANDS.iter().position(|c| upper.starts_with(c.verb)) {
            None => return Err(SessionError::Syntax),
            Some(i) => i,
        };
        let spec = &COMMANDS[idx];
        if self.comstate & spec.mask == 0 {
            return Err(SessionError::BadSequence);
        }
        if spec.flags & FLAG_LONG == 0 && line.len() > REPLY_LIMIT {
            return Err(SessionError::TooBig);
        }
        let rest = &line[spec.verb.len()..];
        if spec.flags & FLAG_ARGS == 0 && !rest.is_empty() {
            return Err(SessionError::Syntax);
        }
        if self.broken_setup && idx > 2 {
            self.reply("451 4.3.5 system config error").await?;
            return Err(SessionError::Done);
        }
        // HELO/EHLO/AUTH carry their argument after one space
        let arg = match idx {
            3 | 4 | 9 => match rest.strip_prefix(' ') {
                None => return Err(SessionError::Syntax),
                Some(a) => a,
            },
            _ => rest,
        };

        let flow = match idx {
            0 => self.smtp_noop().await?,
            1 => self.smtp_quit().await?,
            2 => self.smtp_rset().await?,
            3 => self.smtp_helo(arg).await?,
            4 => self.smtp_ehlo(arg).await?,
            5 => self.smtp_from(arg, line.len()).await?,
            6 => self.smtp_rcpt(arg).await?,
            7 => self.smtp_data().await?,
            8 => self.smtp_starttls().await?,
            9 => self.smtp_auth(arg).await?,
            _ => self.smtp_vrfy().await?,
        };

        match flow {
            Flow::Continue => {
                self.comstate = match spec.next {
                    Next::Keep => self.comstate,
                    Next::SelfBit => 1 << idx,
                    Next::Data => STATE_DATA,
                    Next::Rset => {
                        if self.xmit.helo.is_some() {
                            STATE_HELO << (self.xmit.esmtp as u16)
                        } else {
                            STATE_INITIAL
                        }
                    }
                };
                self.badcmds = 0;
            }
            Flow::Stay => {
                self.badcmds = 0;
            }
            Flow::Quit => {}
        }
        Ok(flow)
    }

    async fn handle_error(&mut self, e: SessionError) -> Result<ErrorFlow, NetError> {
        if self.badcmds >= MAX_BAD_CMDS {
            let _ = self.say("550-5.7.1 too many bad commands").await;
            info!(
                "dropped connection from [{}] {{too many bad commands}}",
                self.xmit.remote_ip_str
            );
            let _ = self.say("550 5.7.1 die slow and painful").await;
            return Ok(ErrorFlow::Drop);
        }
        self.badcmds += 1;
        match e {
            SessionError::Syntax => {
                self.tarpit().await;
                self.say("550 5.5.2 command syntax error").await?;
            }
            SessionError::BadParameter => {
                self.tarpit().await;
                self.say("555 5.5.2 unrecognized command parameter").await?;
            }
            SessionError::TooBig => {
                self.tarpit().await;
                self.say("500 5.5.2 line too long").await?;
            }
            SessionError::BadSequence => {
                self.tarpit().await;
                self.say("503 5.5.1 Bad sequence of commands").await?;
            }
            SessionError::OutOfMemory => {
                // give the peer a chance to back off
                self.say("452-4.3.0 out of memory").await?;
                smol::Timer::after(Duration::from_secs(30)).await;
                self.say("452-4.3.0 give me some time to recover").await?;
                smol::Timer::after(Duration::from_secs(30)).await;
                self.badcmds = 0;
                self.say("452 4.3.0 please try again later").await?;
            }
            SessionError::Io => {
                self.badcmds = 0;
                self.say("451 4.3.0 IO error, please try again later").await?;
            }
            SessionError::MessageSize => {
                self.badcmds = 0;
                self.say("552 4.3.1 Too much mail data").await?;
            }
            SessionError::QueueReadOnly => {
                error!("queue filesystem looks read only");
                self.badcmds = 0;
                self.say("452 4.3.5 cannot write to queue").await?;
            }
            SessionError::Control => {
                self.badcmds = 0;
                self.say("421 4.3.5 unable to read controls").await?;
            }
            SessionError::Done => {
                self.badcmds = 0;
            }
            SessionError::Bogus => {}
            SessionError::Net(ne) => return Err(ne),
        }
        Ok(ErrorFlow::Continue)
    }

    /// Throw away the mail transaction.
    pub(crate) fn freedata(&mut self) {
        self.xmit.mail_from = None;
        self.xmit.from_mx = None;
        self.xmit.announced_size = 0;
        self.xmit.strict_2822 = false;
        self.recipients.clear();
        self.goodrcpt = 0;
        self.badbounce = false;
    }

    pub(crate) fn post_helo_state(&self) -> u16 {
        STATE_HELO << (self.xmit.esmtp as u16)
    }

    /// The protocol name for Received lines: SMTP, ESMTP, plus S for TLS
    /// and A for an authenticated peer.
    pub(crate) fn protocol_name(&self) -> &'static str {
        match (self.xmit.esmtp, self.tls_active, self.xmit.auth_name.is_some()) {
            (false, _, _) => "SMTP",
            (true, false, false) => "ESMTP",
            (true, true, false) => "ESMTPS",
            (true, false, true) => "ESMTPA",
            (true, true, true) => "ESMTPSA",
        }
    }

    fn helovalid(&self, arg: &str) -> HeloInfo {
        let mut status = 0u8;
        if arg.eq_ignore_ascii_case(&self.deps.cfg.helo_name) {
            status |= HELO_OURNAME;
        }
        if let Some(inner) = arg.strip_prefix('[').and_then(|a| a.strip_suffix(']')) {
            let lit = inner.strip_prefix("IPv6:").unwrap_or(inner);
            let literal = lit.parse::<std::net::IpAddr>().ok().map(|ip| match ip {
                std::net::IpAddr::V4(v4) => smtp_dns::map_v4(v4),
                std::net::IpAddr::V6(v6) => v6,
            });
            match literal {
                // greeting us with our own address is as fishy as using
                // our name
                Some(ip) if Some(ip) == self.xmit.local_ip => status |= HELO_OURNAME,
                Some(ip) if ip == self.xmit.remote_ip => {}
                _ => status |= HELO_LITERAL_MISMATCH,
            }
        } else if !domain_valid(arg) {
            status |= HELO_NOFQDN;
        }
        HeloInfo {
            name: arg.to_owned(),
            status,
        }
    }

    async fn smtp_noop(&mut self) -> Result<Flow, SessionError> {
        self.reply("250 2.0.0 ok").await?;
        Ok(Flow::Continue)
    }

    async fn smtp_quit(&mut self) -> Result<Flow, SessionError> {
        let me = self.deps.cfg.helo_name.clone();
        self.reply_parts(&["221 2.0.0 ", &me, " service closing transmission channel"])
            .await?;
        Ok(Flow::Quit)
    }

    async fn smtp_rset(&mut self) -> Result<Flow, SessionError> {
        self.freedata();
        self.reply("250 2.0.0 ok").await?;
        Ok(Flow::Continue)
    }

    async fn smtp_vrfy(&mut self) -> Result<Flow, SessionError> {
        self.reply("252 send some mail, I'll do my very best").await?;
        Ok(Flow::Continue)
    }

    async fn smtp_helo(&mut self, arg: &str) -> Result<Flow, SessionError> {
        self.freedata();
        self.xmit.esmtp = false;
        self.xmit.spf = None;
        self.xmit.body_8bit = false;
        self.xmit.helo = Some(self.helovalid(arg));
        let me = self.deps.cfg.helo_name.clone();
        self.reply_parts(&["250 ", &me]).await?;
        Ok(Flow::Continue)
    }

    async fn smtp_ehlo(&mut self, arg: &str) -> Result<Flow, SessionError> {
        self.freedata();
        self.xmit.esmtp = true;
        self.xmit.spf = None;
        self.xmit.body_8bit = true;
        self.xmit.helo = Some(self.helovalid(arg));

        let cfg = &self.deps.cfg;
        let mut wire = format!(
            "250-{}\r\n250-ENHANCEDSTATUSCODES\r\n250-PIPELINING\r\n250-8BITMIME\r\n",
            cfg.helo_name
        );
        if cfg.auth.is_some() && (!cfg.force_ssl_auth || self.tls_active) {
            wire.push_str("250-AUTH PLAIN LOGIN\r\n");
        }
        if self.deps.tls.is_some() && !self.tls_active {
            wire.push_str("250-STARTTLS\r\n");
        }
        if cfg.databytes > 0 {
            wire.push_str(&format!("250 SIZE {}\r\n", cfg.databytes));
        } else {
            wire.push_str("250 SIZE\r\n");
        }
        self.io.write_line(wire.as_bytes()).await?;
        Ok(Flow::Continue)
    }

    async fn smtp_from(&mut self, arg: &str, line_len: usize) -> Result<Flow, SessionError> {
        let (path, rest) = match parse_path(arg, false) {
            Err(_) => {
                self.reply("501 5.1.3 domain of mail address syntactically incorrect")
                    .await?;
                return Err(SessionError::Done);
            }
            Ok(p) => p,
        };
        let mailbox = match path {
            MailPath::Bounce => None,
            MailPath::Mailbox(m) => Some(m),
            MailPath::Postmaster => return Err(SessionError::Syntax),
        };

        // ESMTP parameters are only valid after EHLO
        if !rest.is_empty() && !self.xmit.esmtp {
            return Err(SessionError::Syntax);
        }
        let mut announced = 0u64;
        let mut size_seen = false;
        let mut body_seen = false;
        let mut body_8bit = self.xmit.body_8bit;
        let mut p = rest;
        while !p.is_empty() {
            let up = p.to_ascii_uppercase();
            if let Some(v) = up.strip_prefix(" SIZE=") {
                if size_seen {
                    return Err(SessionError::Syntax);
                }
                let digits: String = v.chars().take_while(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    return Err(SessionError::Syntax);
                }
                announced = digits.parse().map_err(|_| SessionError::Syntax)?;
                size_seen = true;
                p = &p[" SIZE=".len() + digits.len()..];
                if !p.is_empty() && !p.starts_with(' ') {
                    return Err(SessionError::Syntax);
                }
            } else if let Some(v) = up.strip_prefix(" BODY=") {
                if body_seen {
                    return Err(SessionError::Syntax);
                }
                body_seen = true;
                let consumed = if v.starts_with("8BITMIME") {
                    body_8bit = true;
                    "8BITMIME".len()
                } else if v.starts_with("7BIT") {
                    body_8bit = false;
                    "7BIT".len()
                } else {
                    return Err(SessionError::Syntax);
                };
                p = &p[" BODY=".len() + consumed..];
                if !p.is_empty() && !p.starts_with(' ') {
                    return Err(SessionError::Syntax);
                }
            } else {
                return Err(SessionError::BadParameter);
            }
        }
        // RFC 1870 grants 26 extra bytes to a MAIL line carrying SIZE
        let valid_length = REPLY_LIMIT + if size_seen { 26 } else { 0 };
        if line_len > valid_length {
            return Err(SessionError::TooBig);
        }

        if !self.check_queue_space(announced)? {
            self.reply("452 4.3.1 Requested action not taken: insufficient system storage")
                .await?;
            return Err(SessionError::Done);
        }

        // a locally claimed sender must actually exist
        if let Some(m) = &mailbox {
            let is_local = self
                .deps
                .backend
                .local_domain(&m.domain)
                .map_err(|e| self.control_err(e))?;
            if is_local {
                let (exists, _) = self
                    .deps
                    .backend
                    .probe(&m.local, &m.domain)
                    .map_err(|e| self.control_err(e))?;
                if !exists.accepts() {
                    let addr = m.address();
                    info!(
                        "rejected message from <{}> from IP [{}] {{faked local sender}}",
                        addr, self.xmit.remote_ip_str
                    );
                    self.tarpit().await;
                    self.reply_parts(&[
                        "550 5.1.0 sending user <",
                        &addr,
                        "> faked, I will not accept this mail",
                    ])
                    .await?;
                    return Err(SessionError::Bogus);
                }
            }
        }

        // MX state and SPF verdict for the sender domain
        let dns = self.deps.dns.clone();
        if let Some(m) = &mailbox {
            self.xmit.from_mx = Some(match mx_list(&*dns, &m.domain).await {
                Ok(l) => MxResult::List(l),
                Err(smtp_dns::DnsError::NoRecord) => MxResult::NoRecord,
                Err(smtp_dns::DnsError::TempFail) => MxResult::TempFail,
                Err(smtp_dns::DnsError::PermFail) => MxResult::PermFail,
            });
        } else {
            self.xmit.from_mx = None;
        }
        let spf_target = match &mailbox {
            Some(m) => m.domain.clone(),
            None => self.xmit.helo_str().to_owned(),
        };
        let outcome = {
            let sctx = SpfContext {
                dns: &*dns,
                remote_ip: self.xmit.remote_ip,
                remote_host: self.xmit.remote_host.as_deref(),
                helo: self.xmit.helo_str(),
                my_helo: &self.deps.cfg.helo_name,
                sender: mailbox.as_ref(),
            };
            sctx.check_host(&spf_target).await
        };
        self.xmit.spf = Some(outcome);

        self.xmit.mail_from = mailbox;
        self.xmit.announced_size = announced;
        self.xmit.body_8bit = body_8bit;
        self.badbounce = false;
        self.goodrcpt = 0;
        let sender = self.xmit.sender_display();
        self.reply_parts(&["250 2.1.0 sender <", &sender, "> ok"]).await?;
        Ok(Flow::Continue)
    }

    async fn smtp_rcpt(&mut self, arg: &str) -> Result<Flow, SessionError> {
        let (path, rest) = match parse_path(arg, true) {
            Err(_) => {
                self.reply("501 5.1.3 domain of mail address syntactically incorrect")
                    .await?;
                return Err(SessionError::Done);
            }
            Ok(p) => p,
        };
        if !rest.is_empty() {
            return Err(SessionError::Syntax);
        }
        if self.recipients.len() >= MAX_RCPT {
            self.reply("452 4.5.3 Too many recipients").await?;
            return Err(SessionError::Done);
        }

        let outcome = match path {
            MailPath::Postmaster => AddrOutcome::Accepted {
                mailbox: None,
                exists: UserExists::Deliverable,
                uc: Userconf::empty(),
            },
            MailPath::Mailbox(m) => {
                resolve(&*self.deps.backend, m).map_err(|e| self.control_err(e))?
            }
            MailPath::Bounce => return Err(SessionError::Syntax),
        };

        let (addr, mut uc) = match outcome {
            AddrOutcome::Accepted { mailbox, uc, .. } => (
                mailbox
                    .map(|m| m.address())
                    .unwrap_or_else(|| "postmaster".to_owned()),
                uc,
            ),
            AddrOutcome::NoSuchUser { mailbox } => {
                let addr = mailbox.address();
                info!(
                    "rejected message to <{}> from <{}> from IP [{}] {{no such user}}",
                    addr,
                    self.xmit.sender_display(),
                    self.xmit.remote_ip_str
                );
                self.tarpit().await;
                self.reply_parts(&["550 5.1.1 no such user <", &addr, ">"]).await?;
                return Err(SessionError::Bogus);
            }
            AddrOutcome::NotLocal { mailbox } => {
                let may_relay = self.xmit.auth_name.is_some()
                    || self.xmit.tls_peer.is_some()
                    || self.relay_allowed()?;
                if !may_relay {
                    info!(
                        "rejected message to <{}> from <{}> from IP [{}] {{relaying denied}}",
                        mailbox.address(),
                        self.xmit.sender_display(),
                        self.xmit.remote_ip_str
                    );
                    self.tarpit().await;
                    self.reply("551 5.7.1 relaying denied").await?;
                    return Err(SessionError::Bogus);
                }
                (mailbox.address(), Userconf::empty())
            }
        };

        if self.recipients.try_reserve(1).is_err() {
            return Err(SessionError::OutOfMemory);
        }
        self.recipients.push(Recipient {
            mailbox: addr.clone(),
            accepted: false,
        });

        uc.load_filterconf().map_err(|e| self.control_err(e))?;
        let (strict, _) = uc.get_setting_global(self.deps.cfg.global_conf.as_deref(), "check2822");
        if strict > 0 {
            self.xmit.strict_2822 = true;
        }

        let verdict = {
            let control_dir = self.deps.cfg.control_dir();
            let ctx = FilterCtx {
                uc: &uc,
                control_dir: &control_dir,
                global_conf: self.deps.cfg.global_conf.as_deref(),
                dns: &*self.deps.dns,
                xmit: &self.xmit,
                my_helo: &self.deps.cfg.helo_name,
            };
            run_filters(&ctx).await.map_err(|e| self.control_err(e))?
        };

        // fail_hard_on_temp promotes a temporary denial; nonexist_on_block
        // hides the policy reason behind "no such user"
        let verdict = match verdict {
            Filter::DeniedTemp { reply, hard_reply, log } => {
                if uc.get_setting("fail_hard_on_temp").0 > 0 {
                    Filter::Denied { reply: hard_reply, log }
                } else {
                    Filter::DeniedTemp { reply, hard_reply, log }
                }
            }
            v => v,
        };
        let verdict = match verdict {
            Filter::Denied { reply, log } => {
                if uc.get_setting("nonexist_on_block").0 > 0 {
                    Filter::Denied {
                        reply: format!("550 5.1.1 no such user <{}>", addr),
                        log,
                    }
                } else {
                    Filter::Denied { reply, log }
                }
            }
            v => v,
        };

        match verdict {
            Filter::Passed => {}
            Filter::Denied { reply, log } | Filter::DeniedTemp { reply, log, .. } => {
                info!(
                    "rejected message to <{}> from <{}> from IP [{}] {{{}}}",
                    addr,
                    self.xmit.sender_display(),
                    self.xmit.remote_ip_str,
                    log
                );
                self.tarpit().await;
                self.reply_parts(&[&reply]).await?;
                return Err(SessionError::Done);
            }
        }

        // a bounce may have exactly one recipient
        if self.comstate != STATE_MAIL && self.xmit.mail_from.is_none() {
            self.tarpit().await;
            self.reply("550 5.5.3 bounce messages must not have more than one recipient")
                .await?;
            if !self.badbounce {
                if let Some(first) = self.recipients.first() {
                    info!(
                        "rejected message to <{}> from IP [{}] {{bad bounce}}",
                        first.mailbox, self.xmit.remote_ip_str
                    );
                }
                self.badbounce = true;
            }
            info!(
                "rejected message to <{}> from IP [{}] {{bad bounce}}",
                addr, self.xmit.remote_ip_str
            );
            for r in &mut self.recipients {
                r.accepted = false;
            }
            self.goodrcpt = 0;
            return Err(SessionError::Bogus);
        }

        self.goodrcpt += 1;
        if let Some(r) = self.recipients.last_mut() {
            r.accepted = true;
        }
        self.reply_parts(&["250 2.1.5 recipient <", &addr, "> OK"]).await?;
        Ok(Flow::Continue)
    }

    async fn smtp_starttls(&mut self) -> Result<Flow, SessionError> {
        let params = match &self.deps.tls {
            None => {
                self.reply("454 4.3.0 TLS not available").await?;
                return Err(SessionError::Done);
            }
            Some(p) => p.clone(),
        };
        if self.io.has_pending().await? {
            self.reply("503 5.5.1 pipelining not allowed with STARTTLS").await?;
            return Err(SessionError::Done);
        }
        self.reply("220 2.0.0 ready to start TLS").await?;

        let placeholder: DynAsyncReadWrite = duplexify::Duplex::new(
            Box::pin(futures::io::empty()),
            Box::pin(futures::io::sink()),
        );
        let cleartext = self.io.replace_stream(placeholder);
        match params.acceptor.accept(cleartext).await {
            Ok(stream) => {
                let (r, w) = stream.split();
                let tls: DynAsyncReadWrite = duplexify::Duplex::new(Box::pin(r), Box::pin(w));
                self.io.replace_stream(tls);
            }
            Err(e) => {
                warn!("TLS handshake failed: {}", e);
                return Err(SessionError::Net(NetError::Io(e)));
            }
        }
        self.tls_active = true;
        self.freedata();
        self.xmit.helo = None;
        self.xmit.esmtp = false;
        self.comstate = STATE_INITIAL;
        Ok(Flow::Stay)
    }

    pub(crate) fn control_err(&self, e: std::io::Error) -> SessionError {
        error!("error: unable to read control files: {}", e);
        SessionError::Control
    }

    fn relay_allowed(&mut self) -> Result<bool, SessionError> {
        if let Some(v) = self.relay_client {
            return Ok(v);
        }
        let name = if self.xmit.ipv4_mapped {
            "relayclients"
        } else {
            "relayclients6"
        };
        let path = self.deps.cfg.control_path(name);
        let allowed = match load_list(&path) {
            Err(e) => return Err(self.control_err(e)),
            Ok(None) => false,
            Ok(Some(entries)) => {
                let mut hit = false;
                for e in &entries {
                    match ip_entry_matches(e, &self.xmit.remote_ip) {
                        Some(true) => {
                            hit = true;
                            break;
                        }
                        Some(false) => {}
                        None => {
                            // reject everything on parse error, anything
                            // else would turn this into an open relay
                            error!("parse error in control/{}", name);
                            hit = false;
                            break;
                        }
                    }
                }
                hit
            }
        };
        self.relay_client = Some(allowed);
        Ok(allowed)
    }

    /// `false` means the queue cannot take a message of the announced
    /// size right now.
    fn check_queue_space(&self, announced: u64) -> Result<bool, SessionError> {
        let cfg = &self.deps.cfg;
        if cfg.databytes > 0 && announced > cfg.databytes {
            return Ok(false);
        }
        let path = cfg.qmail_dir.join("queue/lock/sendmutex");
        let cpath = match CString::new(path.as_os_str().as_bytes()) {
            Ok(c) => c,
            Err(_) => return Ok(true),
        };
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = loop {
            let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
            if rc != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break rc;
        };
        if rc != 0 {
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EACCES) | Some(libc::ENOSYS) => {
                    // qmail-send not running or no permission, nothing to
                    // check against
                    warn!("can not get free queue disk space");
                    return Ok(true);
                }
                Some(libc::ENOMEM) => return Err(SessionError::OutOfMemory),
                _ => {
                    error!("critical: can not get free queue disk space");
                    return Err(SessionError::Io);
                }
            }
        }
        if st.f_flag & libc::ST_RDONLY != 0 {
            return Err(SessionError::QueueReadOnly);
        }
        if announced > 0 && (st.f_bsize as u64).saturating_mul(st.f_bavail as u64) < announced {
            return Ok(false);
        }
        Ok(true)
    }
}

/// Match one relayclients entry ("a.b.c.d", "a.b.c.d/n", or the IPv6
/// forms) against the peer address. `None` is a parse error.
pub fn ip_entry_matches(entry: &str, ip: &Ipv6Addr) -> Option<bool> {
    let (addr, prefix) = match entry.find('/') {
        None => (entry, None),
        Some(p) => (&entry[..p], Some(entry[p + 1..].parse::<u8>().ok()?)),
    };
    if let Ok(v4) = addr.parse::<std::net::Ipv4Addr>() {
        let prefix = prefix.unwrap_or(32);
        if prefix > 32 {
            return None;
        }
        return Some(ip4_matchnet(ip, v4, prefix));
    }
    if let Ok(v6) = addr.parse::<Ipv6Addr>() {
        let prefix = prefix.unwrap_or(128);
        if prefix > 128 {
            return None;
        }
        return Some(ip6_matchnet(ip, &v6, prefix));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        pin::Pin,
        sync::{Arc, Mutex},
        task::{Context, Poll},
    };

    use futures::{
        executor,
        io::{AsyncRead, AsyncWrite},
    };
    use smtp_dns::{map_v4, StaticDns};

    use crate::{
        addrparse::{UserBackend, UserExists},
        queue::{Queue, QueueHandle},
        userconf::Userconf,
    };

    // -- a duplex stream driven by a script: each input chunk is released
    // only after the server has produced the given number of reply lines,
    // so the server's own replies pace the conversation like a real peer
    // would.

    struct ScriptInner {
        chunks: std::collections::VecDeque<(usize, Vec<u8>)>,
        current: Vec<u8>,
        out: Vec<u8>,
        lines_out: usize,
    }

    #[derive(Clone)]
    struct Script(Arc<Mutex<ScriptInner>>);

    impl Script {
        fn new(chunks: Vec<(usize, &[u8])>) -> Script {
            Script(Arc::new(Mutex::new(ScriptInner {
                chunks: chunks
                    .into_iter()
                    .map(|(gate, data)| (gate, data.to_vec()))
                    .collect(),
                current: Vec::new(),
                out: Vec::new(),
                lines_out: 0,
            })))
        }

        fn output(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap().out).into_owned()
        }

        fn reply_codes(&self) -> Vec<String> {
            self.output()
                .split("\r\n")
                .filter(|l| !l.is_empty())
                .map(|l| l.chars().take(4).collect())
                .collect()
        }
    }

    struct ScriptRead(Script);
    struct ScriptWrite(Script);

    impl AsyncRead for ScriptRead {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            let mut g = (self.0).0.lock().unwrap();
            if g.current.is_empty() {
                match g.chunks.front() {
                    None => return Poll::Ready(Ok(0)),
                    Some((gate, _)) if *gate <= g.lines_out => {
                        let (_, data) = g.chunks.pop_front().expect("checked front");
                        g.current = data;
                    }
                    Some(_) => {
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }
                }
            }
            let n = buf.len().min(g.current.len());
            buf[..n].copy_from_slice(&g.current[..n]);
            g.current.drain(..n);
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for ScriptWrite {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let mut g = (self.0).0.lock().unwrap();
            g.out.extend_from_slice(buf);
            g.lines_out = g.out.iter().filter(|&&b| b == b'\n').count();
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct TestBackend;

    impl UserBackend for TestBackend {
        fn local_domain(&self, domain: &str) -> io::Result<bool> {
            Ok(domain == "local.example")
        }

        fn probe(&self, local: &str, _domain: &str) -> io::Result<(UserExists, Userconf)> {
            let exists = match local {
                "u" => UserExists::Deliverable,
                _ => UserExists::NoSuchUser,
            };
            Ok((exists, Userconf::empty()))
        }
    }

    struct MockQueue {
        mails: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
        exit: i32,
    }

    struct MockHandle {
        body: Vec<u8>,
        mails: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
        exit: i32,
    }

    #[async_trait::async_trait]
    impl Queue for MockQueue {
        async fn begin(&self) -> io::Result<Box<dyn QueueHandle>> {
            Ok(Box::new(MockHandle {
                body: Vec::new(),
                mails: self.mails.clone(),
                exit: self.exit,
            }))
        }
    }

    #[async_trait::async_trait]
    impl QueueHandle for MockHandle {
        async fn body(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.body.extend_from_slice(chunk);
            Ok(())
        }

        async fn finish(self: Box<Self>, envelope: &[u8]) -> io::Result<i32> {
            self.mails
                .lock()
                .unwrap()
                .push((self.body.clone(), envelope.to_vec()));
            Ok(self.exit)
        }

        async fn abort(self: Box<Self>) {}
    }

    struct Harness {
        script: Script,
        mails: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
        dns: StaticDns,
        global_conf: Option<Vec<String>>,
    }

    impl Harness {
        fn new(chunks: Vec<(usize, &[u8])>) -> Harness {
            Harness {
                script: Script::new(chunks),
                mails: Arc::new(Mutex::new(Vec::new())),
                dns: StaticDns::default(),
                global_conf: None,
            }
        }

        fn run(self) -> (Script, Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>, Result<(), NetError>) {
            let cfg = Arc::new(Config {
                qmail_dir: "/nonexistent-qmail".into(),
                helo_name: "mx.local.example".to_owned(),
                rcpthosts: vec!["local.example".to_owned()],
                timeout: Duration::from_secs(10),
                databytes: 0,
                force_ssl_auth: false,
                global_conf: self.global_conf,
                vpopbounce: None,
                auth: None,
                tarpit: Duration::from_secs(0),
            });
            let deps = Arc::new(Deps {
                cfg,
                dns: Arc::new(self.dns),
                backend: Arc::new(TestBackend),
                queue: Arc::new(MockQueue {
                    mails: self.mails.clone(),
                    exit: 0,
                }),
                tls: None,
            });
            let io: DynAsyncReadWrite = duplexify::Duplex::new(
                Box::pin(ScriptRead(self.script.clone())),
                Box::pin(ScriptWrite(self.script.clone())),
            );
            let xmit = Transmission::new(
                Some(map_v4("192.0.2.2".parse().expect("addr"))),
                None,
                None,
            );
            let res = executor::block_on(interact(io, deps, xmit, true, false));
            (self.script, self.mails, res)
        }
    }

    #[test]
    fn minimal_accept_runs_the_whole_transaction() {
        let h = Harness::new(vec![
            (1, b"HELO client.example\r\n"),
            (2, b"MAIL FROM:<a@remote.example>\r\n"),
            (3, b"RCPT TO:<u@local.example>\r\n"),
            (4, b"DATA\r\n"),
            (5, b"Subject: x\r\n\r\nbody\r\n.\r\n"),
            (6, b"QUIT\r\n"),
        ]);
        let (script, mails, res) = h.run();
        assert!(res.is_ok());
        assert_eq!(
            script.reply_codes(),
            vec!["220 ", "250 ", "250 ", "250 ", "354 ", "250 ", "221 "]
        );

        let mails = mails.lock().unwrap();
        assert_eq!(mails.len(), 1);
        let (body, envelope) = &mails[0];
        let body = String::from_utf8_lossy(body);
        assert!(body.starts_with("Received: from client.example"));
        assert!(body.contains("with SMTP"));
        assert!(body.ends_with("Subject: x\n\nbody\n"));
        assert_eq!(
            envelope.as_slice(),
            b"Fa@remote.example\0Tu@local.example\0\0" as &[u8]
        );
    }

    #[test]
    fn pipelined_commands_get_ordered_replies() {
        let h = Harness::new(vec![
            (1, b"HELO client.example\r\n"),
            (2, b"RSET\r\nMAIL FROM:<a@remote.example>\r\nRCPT TO:<u@local.example>\r\n"),
            (5, b"QUIT\r\n"),
        ]);
        let (script, _, res) = h.run();
        assert!(res.is_ok());
        assert_eq!(
            script.reply_codes(),
            vec!["220 ", "250 ", "250 ", "250 ", "250 ", "221 "]
        );
    }

    #[test]
    fn six_bad_commands_drop_the_connection() {
        let h = Harness::new(vec![
            (1, b"FOO\r\n"),
            (2, b"FOO\r\n"),
            (3, b"FOO\r\n"),
            (4, b"FOO\r\n"),
            (5, b"FOO\r\n"),
            (6, b"FOO\r\n"),
        ]);
        let (script, _, res) = h.run();
        assert!(res.is_ok(), "the drop is an orderly close");
        let out = script.output();
        assert_eq!(out.matches("550 5.5.2 command syntax error").count(), 5);
        assert!(out.contains("550-5.7.1 too many bad commands"));
        assert!(out.ends_with("550 5.7.1 die slow and painful\r\n"));
    }

    #[test]
    fn bounce_with_two_recipients_accepts_none() {
        let h = Harness::new(vec![
            (1, b"EHLO client.example\r\n"),
            (6, b"MAIL FROM:<>\r\n"),
            (7, b"RCPT TO:<u@local.example>\r\n"),
            (8, b"RCPT TO:<u@local.example>\r\n"),
            (9, b"DATA\r\n"),
            (10, b"QUIT\r\n"),
        ]);
        let (script, mails, res) = h.run();
        assert!(res.is_ok());
        let out = script.output();
        assert!(out.contains("550 5.5.3 bounce messages must not have more than one recipient"));
        assert!(out.contains("554 5.1.1 no valid recipients"));
        assert!(mails.lock().unwrap().is_empty());
    }

    #[test]
    fn spf_include_cycle_rejects_rcpt_under_policy_three() {
        let mut h = Harness::new(vec![
            (1, b"HELO client.example\r\n"),
            (2, b"MAIL FROM:<x@spam.example>\r\n"),
            (3, b"RCPT TO:<u@local.example>\r\n"),
            (4, b"QUIT\r\n"),
        ]);
        h.dns = StaticDns::default().with_txt("spam.example", &["v=spf1 include:spam.example"]);
        h.global_conf = Some(vec!["spfpolicy=3".to_owned()]);
        let (script, _, res) = h.run();
        assert!(res.is_ok());
        assert!(script.output().contains("550 5.5.2 syntax error in SPF record"));
    }

    #[test]
    fn eight_bit_header_under_strict_checking_is_rejected() {
        let mut h = Harness::new(vec![
            (1, b"HELO client.example\r\n"),
            (2, b"MAIL FROM:<a@remote.example>\r\n"),
            (3, b"RCPT TO:<u@local.example>\r\n"),
            (4, b"DATA\r\n"),
            (5, b"Subj\xc3ct: x\r\n\r\nmore payload ignored\r\n.\r\n"),
            (6, b"QUIT\r\n"),
        ]);
        h.global_conf = Some(vec!["check2822=1".to_owned()]);
        let (script, mails, res) = h.run();
        assert!(res.is_ok());
        let out = script.output();
        assert!(out.contains(
            "550 5.6.0 message does not comply to RfC2822: 8bit character in message header"
        ));
        assert!(mails.lock().unwrap().is_empty());
        // the session is back in command state and QUIT still works
        assert!(out.contains("221 "));
    }

    #[test]
    fn relaying_is_denied_without_credentials() {
        let h = Harness::new(vec![
            (1, b"HELO client.example\r\n"),
            (2, b"MAIL FROM:<a@remote.example>\r\n"),
            (3, b"RCPT TO:<victim@elsewhere.example>\r\n"),
            (4, b"QUIT\r\n"),
        ]);
        let (script, _, res) = h.run();
        assert!(res.is_ok());
        assert!(script.output().contains("551 5.7.1 relaying denied"));
    }

    #[test]
    fn unknown_local_user_is_rejected() {
        let h = Harness::new(vec![
            (1, b"HELO client.example\r\n"),
            (2, b"MAIL FROM:<a@remote.example>\r\n"),
            (3, b"RCPT TO:<nobody@local.example>\r\n"),
            (4, b"QUIT\r\n"),
        ]);
        let (script, _, res) = h.run();
        assert!(res.is_ok());
        assert!(script.output().contains("550 5.1.1 no such user <nobody@local.example>"));
    }

    #[test]
    fn mail_before_helo_is_bad_sequence() {
        let h = Harness::new(vec![
            (1, b"MAIL FROM:<a@remote.example>\r\n"),
            (2, b"QUIT\r\n"),
        ]);
        let (script, _, res) = h.run();
        assert!(res.is_ok());
        assert!(script.output().contains("503 5.5.1 Bad sequence of commands"));
    }

    #[test]
    fn ehlo_advertises_the_feature_set() {
        let h = Harness::new(vec![(1, b"EHLO client.example\r\n"), (6, b"QUIT\r\n")]);
        let (script, _, res) = h.run();
        assert!(res.is_ok());
        let out = script.output();
        assert!(out.contains("250-mx.local.example\r\n"));
        assert!(out.contains("250-ENHANCEDSTATUSCODES\r\n"));
        assert!(out.contains("250-PIPELINING\r\n"));
        assert!(out.contains("250-8BITMIME\r\n"));
        assert!(out.contains("250 SIZE\r\n"));
        // no certificate configured, no AUTH helper: neither is offered
        assert!(!out.contains("STARTTLS"));
        assert!(!out.contains("AUTH"));
    }

    #[test]
    fn ip_entry_matching() {
        let mapped = map_v4("192.0.2.9".parse().expect("addr"));
        assert_eq!(ip_entry_matches("192.0.2.9", &mapped), Some(true));
        assert_eq!(ip_entry_matches("192.0.2.0/24", &mapped), Some(true));
        assert_eq!(ip_entry_matches("198.51.100.0/24", &mapped), Some(false));
        assert_eq!(ip_entry_matches("not an ip", &mapped), None);
        assert_eq!(ip_entry_matches("192.0.2.0/64", &mapped), None);
        let v6: Ipv6Addr = "2001:db8::5".parse().expect("addr");
        assert_eq!(ip_entry_matches("2001:db8::/32", &v6), Some(true));
        assert_eq!(ip_entry_matches("2001:db9::/32", &v6), Some(false));
    }
}
