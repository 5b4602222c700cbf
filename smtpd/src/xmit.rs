//! Per-session transmission state, reset by HELO/EHLO and RSET.

use std::net::Ipv6Addr;

use smtp_dns::{is_v4_mapped, map_v4, MxList};
use smtp_wire::Mailbox;

use crate::spf::SpfOutcome;

/// HELO oddity flags; the `helovalid` policy setting is a bitmask of
/// these.
pub const HELO_NOFQDN: u8 = 1;
pub const HELO_OURNAME: u8 = 2;
pub const HELO_LITERAL_MISMATCH: u8 = 4;

#[derive(Clone, Debug)]
pub struct HeloInfo {
    pub name: String,
    /// Bitwise or of the `HELO_*` flags.
    pub status: u8,
}

/// MX lookup outcome for the sender domain, kept for the policy
/// callbacks.
pub enum MxResult {
    List(MxList),
    NoRecord,
    TempFail,
    PermFail,
}

pub struct Transmission {
    pub remote_ip: Ipv6Addr,
    /// Printable peer address for logs; "unknown" when the environment
    /// did not provide one.
    pub remote_ip_str: String,
    pub ipv4_mapped: bool,
    /// Reverse-DNS name, from the supervisor.
    pub remote_host: Option<String>,
    pub remote_info: Option<String>,
    /// Our own address on this connection, for HELO literal checks.
    pub local_ip: Option<Ipv6Addr>,
    pub helo: Option<HeloInfo>,
    pub esmtp: bool,
    pub auth_name: Option<String>,
    /// Identity proven by a TLS client certificate, when the TLS
    /// collaborator provides one.
    pub tls_peer: Option<String>,
    /// Envelope sender; `None` is a bounce once a transaction is open.
    pub mail_from: Option<Mailbox>,
    pub from_mx: Option<MxResult>,
    pub spf: Option<SpfOutcome>,
    /// SIZE= announced on MAIL FROM.
    pub announced_size: u64,
    /// BODY=8BITMIME was declared (or defaulted by ESMTP).
    pub body_8bit: bool,
    /// RFC 2822 strict header checking requested by a recipient's
    /// config.
    pub strict_2822: bool,
}

impl Transmission {
    pub fn new(remote_ip: Option<Ipv6Addr>, remote_host: Option<String>, remote_info: Option<String>) -> Transmission {
        let (ip, ip_str) = match remote_ip {
            Some(ip) => (ip, crate::xmit::display_ip(&ip)),
            None => (Ipv6Addr::UNSPECIFIED, "unknown".to_owned()),
        };
        Transmission {
            ipv4_mapped: is_v4_mapped(&ip),
            remote_ip: ip,
            remote_ip_str: ip_str,
            remote_host,
            remote_info,
            local_ip: None,
            helo: None,
            esmtp: false,
            auth_name: None,
            tls_peer: None,
            mail_from: None,
            from_mx: None,
            spf: None,
            announced_size: 0,
            body_8bit: false,
            strict_2822: false,
        }
    }

    pub fn from_env() -> Transmission {
        let ip = std::env::var("TCP6REMOTEIP")
            .ok()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<Ipv6Addr>().ok())
            .or_else(|| {
                std::env::var("TCPREMOTEIP")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .and_then(|s| s.parse::<std::net::Ipv4Addr>().ok())
                    .map(map_v4)
            });
        let host = std::env::var("TCPREMOTEHOST").ok().filter(|s| !s.is_empty());
        let info = std::env::var("TCPREMOTEINFO").ok().filter(|s| !s.is_empty());
        let mut xmit = Transmission::new(ip, host, info);
        xmit.local_ip = std::env::var("TCPLOCALIP")
            .ok()
            .filter(|s| !s.is_empty())
            .and_then(|s| {
                s.parse::<Ipv6Addr>()
                    .ok()
                    .or_else(|| s.parse::<std::net::Ipv4Addr>().ok().map(map_v4))
            });
        xmit
    }

    /// The sender for logs and replies; empty for bounces.
    pub fn sender_display(&self) -> String {
        self.mail_from
            .as_ref()
            .map(|m| m.address())
            .unwrap_or_default()
    }

    /// The domain SPF speaks about: the sender domain, or the HELO name
    /// for bounces.
    pub fn spf_domain(&self) -> String {
        match &self.mail_from {
            Some(m) => m.domain.clone(),
            None => self
                .helo
                .as_ref()
                .map(|h| h.name.clone())
                .unwrap_or_default(),
        }
    }

    pub fn helo_str(&self) -> &str {
        self.helo.as_ref().map(|h| h.name.as_str()).unwrap_or("")
    }
}

pub fn display_ip(ip: &Ipv6Addr) -> String {
    match ip.to_ipv4() {
        Some(v4) if is_v4_mapped(ip) => v4.to_string(),
        _ => ip.to_string(),
    }
}

/// One RCPT TO, in arrival order.
pub struct Recipient {
    pub mailbox: String,
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peer_is_unspecified() {
        let x = Transmission::new(None, None, None);
        assert_eq!(x.remote_ip, Ipv6Addr::UNSPECIFIED);
        assert_eq!(x.remote_ip_str, "unknown");
        assert!(!x.ipv4_mapped);
    }

    #[test]
    fn mapped_peer_displays_as_v4() {
        let x = Transmission::new(Some(map_v4("192.0.2.9".parse().unwrap())), None, None);
        assert!(x.ipv4_mapped);
        assert_eq!(x.remote_ip_str, "192.0.2.9");
    }

    #[test]
    fn spf_domain_prefers_sender() {
        let mut x = Transmission::new(None, None, None);
        x.helo = Some(HeloInfo {
            name: "client.example".into(),
            status: 0,
        });
        assert_eq!(x.spf_domain(), "client.example");
        x.mail_from = Some(Mailbox {
            local: "a".into(),
            domain: "sender.example".into(),
        });
        assert_eq!(x.spf_domain(), "sender.example");
    }
}
