//! Typed DNS lookups for SMTP routing.
//!
//! The five primitives the mail engines need (MX, AAAA, A, PTR, TXT) live
//! behind the [`Dns`] trait so that policy code can be driven by an
//! in-memory resolver in tests; [`SystemDns`] is the production
//! implementation on top of `trust-dns-resolver`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};

mod mxlist;
mod statics;

pub use mxlist::{ConnState, MxCandidate, MxList, SYNTHESIZED_PRIORITY};
pub use statics::StaticDns;

/// Lookup failure classes, as the callers need to distinguish them:
/// "definitely no such record" routes differently from "try again later"
/// and from "the zone is broken".
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DnsError {
    #[error("no such record")]
    NoRecord,

    #[error("temporary DNS failure")]
    TempFail,

    #[error("permanent DNS failure")]
    PermFail,
}

fn classify(e: ResolveError) -> DnsError {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NoRecord,
        ResolveErrorKind::Timeout | ResolveErrorKind::Io(_) => DnsError::TempFail,
        _ => DnsError::PermFail,
    }
}

/// Map an IPv4 address into the v4-mapped IPv6 space; every address in
/// this crate travels as an `Ipv6Addr`.
pub fn map_v4(ip: Ipv4Addr) -> Ipv6Addr {
    ip.to_ipv6_mapped()
}

pub fn is_v4_mapped(ip: &Ipv6Addr) -> bool {
    let seg = ip.segments();
    seg[..5] == [0, 0, 0, 0, 0] && seg[5] == 0xffff
}

/// Undo `map_v4` where the system resolver wants a real `IpAddr`.
pub fn unmap(ip: &Ipv6Addr) -> IpAddr {
    match ip.to_ipv4() {
        Some(v4) if is_v4_mapped(ip) => IpAddr::V4(v4),
        _ => IpAddr::V6(*ip),
    }
}

/// Whether `ip` (v4-mapped) lies within `net/prefix`.
pub fn ip4_matchnet(ip: &Ipv6Addr, net: Ipv4Addr, prefix: u8) -> bool {
    if !is_v4_mapped(ip) || prefix > 32 {
        return false;
    }
    let ip4 = match ip.to_ipv4() {
        Some(v4) => u32::from(v4),
        None => return false,
    };
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
    (ip4 & mask) == (u32::from(net) & mask)
}

/// Whether `ip` lies within `net/prefix`.
pub fn ip6_matchnet(ip: &Ipv6Addr, net: &Ipv6Addr, prefix: u8) -> bool {
    if prefix > 128 {
        return false;
    }
    let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) };
    (u128::from_be_bytes(ip.octets()) & mask) == (u128::from_be_bytes(net.octets()) & mask)
}

#[async_trait]
pub trait Dns: Send + Sync {
    /// MX records as (preference, exchange) pairs, unsorted.
    async fn mx(&self, host: &str) -> Result<Vec<(u16, String)>, DnsError>;

    /// AAAA records.
    async fn aaaa(&self, host: &str) -> Result<Vec<Ipv6Addr>, DnsError>;

    /// A records, v4-mapped.
    async fn a(&self, host: &str) -> Result<Vec<Ipv6Addr>, DnsError>;

    /// Reverse lookup of one address.
    async fn ptr(&self, ip: &Ipv6Addr) -> Result<String, DnsError>;

    /// TXT records, one string per record (character-strings joined).
    async fn txt(&self, host: &str) -> Result<Vec<String>, DnsError>;
}

/// All addresses of a host: AAAA first, falling back to v4-mapped A when
/// there is no AAAA record at all.
pub async fn host_addrs(dns: &dyn Dns, host: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
    match dns.aaaa(host).await {
        Ok(addrs) if !addrs.is_empty() => Ok(addrs),
        Ok(_) | Err(DnsError::NoRecord) => dns.a(host).await,
        Err(e) => Err(e),
    }
}

/// Build the MX candidate list for a target host.
///
/// Every exchange is resolved to its addresses; when the host has *no MX
/// records* (as opposed to not existing) its own AAAA/A records are used
/// instead, carrying [`SYNTHESIZED_PRIORITY`] so that explicit MX records
/// always sort ahead of them. This is the only place that priority is
/// ever assigned.
pub async fn mx_list(dns: &dyn Dns, host: &str) -> Result<MxList, DnsError> {
    let records = match dns.mx(host).await {
        Ok(r) if !r.is_empty() => r,
        Ok(_) | Err(DnsError::NoRecord) => {
            let addrs = host_addrs(dns, host).await?;
            return Ok(MxList::synthesized(host, addrs));
        }
        Err(e) => return Err(e),
    };

    let mut list = MxList::default();
    let mut temp_seen = false;
    for (pref, exchange) in records {
        match host_addrs(dns, &exchange).await {
            Ok(addrs) => {
                for addr in addrs {
                    list.push(MxCandidate::new(addr, u32::from(pref), Some(exchange.clone())));
                }
            }
            Err(DnsError::NoRecord) => {}
            Err(DnsError::TempFail) => temp_seen = true,
            Err(DnsError::PermFail) => {}
        }
    }
    if list.is_empty() {
        if temp_seen {
            return Err(DnsError::TempFail);
        }
        return Err(DnsError::NoRecord);
    }
    Ok(list)
}

/// The production resolver, configured from the system configuration.
pub struct SystemDns {
    resolver: async_std_resolver::AsyncStdResolver,
}

impl SystemDns {
    pub async fn from_system_conf() -> Result<SystemDns, ResolveError> {
        Ok(SystemDns {
            resolver: async_std_resolver::resolver_from_system_conf().await?,
        })
    }
}

#[async_trait]
impl Dns for SystemDns {
    async fn mx(&self, host: &str) -> Result<Vec<(u16, String)>, DnsError> {
        let lookup = self.resolver.mx_lookup(host).await.map_err(classify)?;
        Ok(lookup
            .into_iter()
            .map(|mx| {
                let mut name = mx.exchange().to_ascii();
                if name.ends_with('.') {
                    name.pop();
                }
                (mx.preference(), name)
            })
            .collect())
    }

    async fn aaaa(&self, host: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let lookup = self.resolver.ipv6_lookup(host).await.map_err(classify)?;
        Ok(lookup.into_iter().collect())
    }

    async fn a(&self, host: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let lookup = self.resolver.ipv4_lookup(host).await.map_err(classify)?;
        Ok(lookup.into_iter().map(map_v4).collect())
    }

    async fn ptr(&self, ip: &Ipv6Addr) -> Result<String, DnsError> {
        let lookup = self.resolver.reverse_lookup(unmap(ip)).await.map_err(classify)?;
        let name = lookup.into_iter().next().ok_or(DnsError::NoRecord)?;
        let mut name = name.to_ascii();
        if name.ends_with('.') {
            name.pop();
        }
        Ok(name)
    }

    async fn txt(&self, host: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.txt_lookup(host).await.map_err(classify)?;
        Ok(lookup
            .into_iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .concat()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn v4_mapping_roundtrip() {
        let v4: Ipv4Addr = "192.0.2.17".parse().unwrap();
        let mapped = map_v4(v4);
        assert!(is_v4_mapped(&mapped));
        assert_eq!(unmap(&mapped), IpAddr::V4(v4));
        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!(!is_v4_mapped(&v6));
        assert_eq!(unmap(&v6), IpAddr::V6(v6));
    }

    #[test]
    fn mx_fallback_gets_synthesized_priority() {
        let dns = StaticDns::default().with_aaaa("onlyaaaa.example", &["2001:db8::1"]);
        let list = block_on(mx_list(&dns, "onlyaaaa.example")).unwrap();
        assert_eq!(list.len(), 1);
        let c = list.iter().next().unwrap();
        assert_eq!(c.priority, SYNTHESIZED_PRIORITY);
        assert_eq!(c.addr, "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(c.state, ConnState::Fresh);
    }

    #[test]
    fn explicit_mx_beats_fallback_and_sorts_stably() {
        let dns = StaticDns::default()
            .with_mx("multi.example", &[(20, "b.example"), (10, "a.example"), (10, "a2.example")])
            .with_aaaa("a.example", &["2001:db8::a"])
            .with_aaaa("a2.example", &["2001:db8::a2"])
            .with_aaaa("b.example", &["2001:db8::b"]);
        let mut list = block_on(mx_list(&dns, "multi.example")).unwrap();
        list.sort();
        let prios: Vec<u32> = list.iter().map(|c| c.priority).collect();
        assert_eq!(prios, vec![10, 10, 20]);
        let names: Vec<&str> = list.iter().map(|c| c.name.as_deref().unwrap()).collect();
        assert_eq!(names, vec!["a.example", "a2.example", "b.example"]);
    }

    #[test]
    fn a_records_are_mapped_when_no_aaaa() {
        let dns = StaticDns::default().with_a("v4only.example", &["192.0.2.5"]);
        let addrs = block_on(host_addrs(&dns, "v4only.example")).unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(is_v4_mapped(&addrs[0]));
    }

    #[test]
    fn net_matching() {
        let mapped = map_v4("192.0.2.130".parse().unwrap());
        assert!(ip4_matchnet(&mapped, "192.0.2.128".parse().unwrap(), 25));
        assert!(!ip4_matchnet(&mapped, "192.0.2.0".parse().unwrap(), 25));
        assert!(ip4_matchnet(&mapped, "192.0.2.130".parse().unwrap(), 32));

        let v6: Ipv6Addr = "2001:db8:1:2::5".parse().unwrap();
        assert!(ip6_matchnet(&v6, &"2001:db8::".parse().unwrap(), 32));
        assert!(!ip6_matchnet(&v6, &"2001:db9::".parse().unwrap(), 32));
        assert!(!ip4_matchnet(&v6, "192.0.2.0".parse().unwrap(), 24));
    }

    #[test]
    fn missing_host_is_no_record() {
        let dns = StaticDns::default();
        assert_eq!(block_on(mx_list(&dns, "void.example")), Err(DnsError::NoRecord));
    }
}
