//! SPF evaluation (`check_host`), historical SPF1 grammar.
//!
//! The evaluator recurses through `include:` and `redirect=` with an
//! explicit depth counter; anything deeper than 20 levels is a permanent
//! error, which also bounds evaluation of record cycles.

use std::{future::Future, net::Ipv6Addr, pin::Pin};

use smtp_dns::{host_addrs, ip4_matchnet, ip6_matchnet, is_v4_mapped, mx_list, Dns, DnsError};
use smtp_wire::{domain_valid, Mailbox};

const MAX_RECURSION: u32 = 20;
const SPF_DELIMITERS: &str = ".-+,/_=";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpfVerdict {
    None,
    Neutral,
    Pass,
    SoftFail,
    Fail,
    TempError,
    PermError,
}

impl SpfVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            SpfVerdict::None => "none",
            SpfVerdict::Neutral => "neutral",
            SpfVerdict::Pass => "pass",
            SpfVerdict::SoftFail => "softfail",
            SpfVerdict::Fail => "fail",
            SpfVerdict::TempError => "temperror",
            SpfVerdict::PermError => "permerror",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpfOutcome {
    pub verdict: SpfVerdict,
    /// Expansion of the record's `exp=` modifier, set on `Fail`.
    pub explanation: Option<String>,
}

impl SpfOutcome {
    fn of(verdict: SpfVerdict) -> SpfOutcome {
        SpfOutcome {
            verdict,
            explanation: None,
        }
    }
}

/// Everything macro expansion and mechanism evaluation can refer to.
pub struct SpfContext<'a> {
    pub dns: &'a dyn Dns,
    pub remote_ip: Ipv6Addr,
    /// Reverse-DNS name of the peer, if any.
    pub remote_host: Option<&'a str>,
    /// The peer's HELO argument.
    pub helo: &'a str,
    /// Our own hostname, for `%{r}`.
    pub my_helo: &'a str,
    /// Envelope sender; `None` for bounces.
    pub sender: Option<&'a Mailbox>,
}

enum MechResult {
    Match,
    NoMatch,
    Temp,
    Perm,
}

impl<'a> SpfContext<'a> {
    pub async fn check_host(&self, domain: &str) -> SpfOutcome {
        self.eval(domain.to_owned(), 0).await
    }

    fn eval<'s>(
        &'s self,
        domain: String,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = SpfOutcome> + Send + 's>> {
        Box::pin(async move {
            if depth >= MAX_RECURSION {
                return SpfOutcome::of(SpfVerdict::PermError);
            }
            // redirect targets are exempt from the strict domain rule
            if depth == 0 && !domain_valid(&domain) {
                return SpfOutcome::of(SpfVerdict::Fail);
            }

            let txts = match self.dns.txt(&domain).await {
                Ok(t) => t,
                Err(DnsError::NoRecord) => return SpfOutcome::of(SpfVerdict::None),
                Err(DnsError::TempFail) => return SpfOutcome::of(SpfVerdict::TempError),
                Err(DnsError::PermFail) => return SpfOutcome::of(SpfVerdict::PermError),
            };
            let records: Vec<&str> = txts
                .iter()
                .filter(|t| *t == "v=spf1" || t.starts_with("v=spf1 "))
                .map(|t| t.as_str())
                .collect();
            let record = match records.len() {
                0 => return SpfOutcome::of(SpfVerdict::None),
                1 => records[0],
                _ => return SpfOutcome::of(SpfVerdict::PermError),
            };
            let body = record["v=spf1".len()..].trim();

            let mut redirect = None;
            for token in body.split_ascii_whitespace() {
                let (qualifier, mech) = split_qualifier(token);

                // modifiers
                if let Some(target) = modifier(mech, "redirect") {
                    if redirect.is_none() {
                        match self.expand(target, &domain, false) {
                            Ok(t) => redirect = Some(t),
                            Err(()) => return SpfOutcome::of(SpfVerdict::PermError),
                        }
                    }
                    continue;
                }
                if modifier(mech, "exp").is_some() {
                    continue;
                }

                let result = match self.eval_mechanism(mech, &domain, depth).await {
                    Ok(r) => r,
                    Err(outcome) => return outcome,
                };
                match result {
                    MechResult::NoMatch => continue,
                    MechResult::Temp => return SpfOutcome::of(SpfVerdict::TempError),
                    MechResult::Perm => return SpfOutcome::of(SpfVerdict::PermError),
                    MechResult::Match => {
                        let mut outcome = SpfOutcome::of(qualifier);
                        if qualifier == SpfVerdict::Fail {
                            outcome.explanation = self.find_explanation(body, &domain);
                        }
                        return outcome;
                    }
                }
            }

            match redirect {
                Some(target) => self.eval(target, depth + 1).await,
                None => SpfOutcome::of(SpfVerdict::Neutral),
            }
        })
    }

    async fn eval_mechanism(
        &self,
        mech: &str,
        domain: &str,
        depth: u32,
    ) -> Result<MechResult, SpfOutcome> {
        let lower = mech.to_ascii_lowercase();

        if lower == "all" {
            return Ok(MechResult::Match);
        }
        if let Some(rest) = prefixed(&lower, mech, "include:") {
            let target = self
                .expand(rest, domain, false)
                .map_err(|()| SpfOutcome::of(SpfVerdict::PermError))?;
            let sub = self.eval(target, depth + 1).await;
            return Ok(match sub.verdict {
                SpfVerdict::Pass => MechResult::Match,
                SpfVerdict::None => MechResult::Perm,
                SpfVerdict::TempError => MechResult::Temp,
                SpfVerdict::PermError => MechResult::Perm,
                SpfVerdict::Fail | SpfVerdict::SoftFail | SpfVerdict::Neutral => MechResult::NoMatch,
            });
        }
        if lower == "a" || lower.starts_with("a:") || lower.starts_with("a/") {
            let (spec, c4, c6) = self
                .domainspec(after_name(mech, 1), domain)
                .map_err(|()| SpfOutcome::of(SpfVerdict::PermError))?;
            let target = spec.unwrap_or_else(|| domain.to_owned());
            return Ok(self.match_addrs(&target, c4, c6).await);
        }
        if lower == "mx" || lower.starts_with("mx:") || lower.starts_with("mx/") {
            let (spec, c4, c6) = self
                .domainspec(after_name(mech, 2), domain)
                .map_err(|()| SpfOutcome::of(SpfVerdict::PermError))?;
            let target = spec.unwrap_or_else(|| domain.to_owned());
            return Ok(self.match_mx(&target, c4, c6).await);
        }
        if lower == "ptr" || lower.starts_with("ptr:") {
            let (spec, c4, c6) = self
                .domainspec(after_name(mech, 3), domain)
                .map_err(|()| SpfOutcome::of(SpfVerdict::PermError))?;
            if c4.is_some() || c6.is_some() {
                return Ok(MechResult::Perm);
            }
            let target = spec.unwrap_or_else(|| domain.to_owned());
            return Ok(self.match_ptr(&target).await);
        }
        if let Some(rest) = prefixed(&lower, mech, "exists:") {
            let (spec, c4, c6) = self
                .domainspec(rest, domain)
                .map_err(|()| SpfOutcome::of(SpfVerdict::PermError))?;
            if c4.is_some() || c6.is_some() {
                return Ok(MechResult::Perm);
            }
            let target = match spec {
                None => return Ok(MechResult::Perm),
                Some(t) => t,
            };
            // exists: matches on A only, never AAAA
            return Ok(match self.dns.a(&target).await {
                Ok(addrs) if !addrs.is_empty() => MechResult::Match,
                Ok(_) | Err(DnsError::NoRecord) => MechResult::NoMatch,
                Err(DnsError::TempFail) => MechResult::Temp,
                Err(DnsError::PermFail) => MechResult::Perm,
            });
        }
        if let Some(rest) = prefixed(&lower, mech, "ip4:") {
            return Ok(self.match_ip4(rest));
        }
        if let Some(rest) = prefixed(&lower, mech, "ip6:") {
            return Ok(self.match_ip6(rest));
        }
        // unknown modifiers are ignored, unknown mechanisms are fatal
        if mech.contains('=') {
            return Ok(MechResult::NoMatch);
        }
        Ok(MechResult::Perm)
    }

    async fn match_addrs(&self, target: &str, c4: Option<u8>, c6: Option<u8>) -> MechResult {
        match host_addrs(self.dns, target).await {
            Ok(addrs) => {
                if self.any_addr_matches(&addrs, c4, c6) {
                    MechResult::Match
                } else {
                    MechResult::NoMatch
                }
            }
            Err(DnsError::NoRecord) => MechResult::NoMatch,
            Err(DnsError::TempFail) => MechResult::Temp,
            Err(DnsError::PermFail) => MechResult::Perm,
        }
    }

    async fn match_mx(&self, target: &str, c4: Option<u8>, c6: Option<u8>) -> MechResult {
        let list = match mx_list(self.dns, target).await {
            Ok(l) => l,
            Err(DnsError::NoRecord) => return MechResult::NoMatch,
            Err(DnsError::TempFail) => return MechResult::Temp,
            Err(DnsError::PermFail) => return MechResult::Perm,
        };
        // implicit MX does not count for the mx mechanism
        if list.is_synthesized() {
            return MechResult::NoMatch;
        }
        let addrs: Vec<Ipv6Addr> = list.iter().map(|c| c.addr).collect();
        if self.any_addr_matches(&addrs, c4, c6) {
            MechResult::Match
        } else {
            MechResult::NoMatch
        }
    }

    fn any_addr_matches(&self, addrs: &[Ipv6Addr], c4: Option<u8>, c6: Option<u8>) -> bool {
        if is_v4_mapped(&self.remote_ip) {
            let prefix = c4.unwrap_or(32);
            addrs.iter().any(|a| {
                a.to_ipv4()
                    .filter(|_| is_v4_mapped(a))
                    .map(|v4| ip4_matchnet(&self.remote_ip, v4, prefix))
                    .unwrap_or(false)
            })
        } else {
            let prefix = c6.unwrap_or(128);
            addrs.iter().any(|a| ip6_matchnet(&self.remote_ip, a, prefix))
        }
    }

    async fn match_ptr(&self, target: &str) -> MechResult {
        let rdns = match self.remote_host {
            None => return MechResult::NoMatch,
            Some(h) => h,
        };
        let rdns_lower = rdns.to_ascii_lowercase();
        let target = target.to_ascii_lowercase();
        if rdns_lower != target && !rdns_lower.ends_with(&format!(".{}", target)) {
            return MechResult::NoMatch;
        }
        // forward-confirm the reverse name
        match host_addrs(self.dns, rdns).await {
            Ok(addrs) if addrs.iter().any(|a| *a == self.remote_ip) => MechResult::Match,
            _ => MechResult::NoMatch,
        }
    }

    fn match_ip4(&self, rest: &str) -> MechResult {
        if !is_v4_mapped(&self.remote_ip) {
            return MechResult::NoMatch;
        }
        let (addr, prefix) = match rest.find('/') {
            None => (rest, 32u8),
            Some(p) => {
                let prefix = match rest[p + 1..].parse::<u8>() {
                    Ok(n) if (8..=32).contains(&n) => n,
                    _ => return MechResult::Perm,
                };
                (&rest[..p], prefix)
            }
        };
        match addr.parse::<std::net::Ipv4Addr>() {
            Ok(net) => {
                if ip4_matchnet(&self.remote_ip, net, prefix) {
                    MechResult::Match
                } else {
                    MechResult::NoMatch
                }
            }
            Err(_) => MechResult::Perm,
        }
    }

    fn match_ip6(&self, rest: &str) -> MechResult {
        if is_v4_mapped(&self.remote_ip) {
            return MechResult::NoMatch;
        }
        let (addr, prefix) = match rest.find('/') {
            None => (rest, 128u8),
            Some(p) => {
                let prefix = match rest[p + 1..].parse::<u8>() {
                    Ok(n) if (8..=128).contains(&n) => n,
                    _ => return MechResult::Perm,
                };
                (&rest[..p], prefix)
            }
        };
        match addr.parse::<Ipv6Addr>() {
            Ok(net) => {
                if ip6_matchnet(&self.remote_ip, &net, prefix) {
                    MechResult::Match
                } else {
                    MechResult::NoMatch
                }
            }
            Err(_) => MechResult::Perm,
        }
    }

    /// Parse `[":" domain-spec] ["/" cidr ["//" cidr6] | "//" cidr6]`,
    /// expanding macros in the domain-spec.
    fn domainspec(
        &self,
        rest: &str,
        domain: &str,
    ) -> Result<(Option<String>, Option<u8>, Option<u8>), ()> {
        let (spec_raw, cidr_raw) = split_cidr(rest);
        let spec = match spec_raw.strip_prefix(':') {
            None if spec_raw.is_empty() => None,
            None => return Err(()),
            Some(s) if s.is_empty() => return Err(()),
            Some(s) => Some(s),
        };

        let (c4, c6) = parse_dual_cidr(cidr_raw)?;

        let spec = match spec {
            None => None,
            Some(s) => {
                let mut expanded = self.expand(s, domain, false)?;
                // over-long expansions lose labels from the left
                while expanded.len() > 255 {
                    match expanded.find('.') {
                        Some(p) if p + 1 < expanded.len() => expanded = expanded[p + 1..].to_owned(),
                        _ => return Err(()),
                    }
                }
                Some(expanded)
            }
        };
        Ok((spec, c4, c6))
    }

    fn find_explanation(&self, body: &str, domain: &str) -> Option<String> {
        for token in body.split_ascii_whitespace() {
            let lower = token.to_ascii_lowercase();
            if let Some(value) = prefixed(&lower, token, "exp=") {
                return self.expand(value, domain, true).ok();
            }
        }
        None
    }

    /// Expand the SPF macro language into a plain string.
    fn expand(&self, input: &str, domain: &str, in_exp: bool) -> Result<String, ()> {
        let cs: Vec<char> = input.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < cs.len() {
            if cs[i] != '%' {
                out.push(cs[i]);
                i += 1;
                continue;
            }
            match cs.get(i + 1) {
                Some('-') => {
                    out.push_str("%20");
                    i += 2;
                }
                Some('_') => {
                    out.push(' ');
                    i += 2;
                }
                Some('%') => {
                    out.push('%');
                    i += 2;
                }
                Some('{') => {
                    let close = cs[i + 2..].iter().position(|&c| c == '}').ok_or(())?;
                    let spec: String = cs[i + 2..i + 2 + close].iter().collect();
                    out.push_str(&self.expand_letter(&spec, domain, in_exp)?);
                    i += close + 3;
                }
                _ => return Err(()),
            }
        }
        Ok(out)
    }

    fn expand_letter(&self, spec: &str, domain: &str, in_exp: bool) -> Result<String, ()> {
        let mut it = spec.chars().peekable();
        let letter = it.next().ok_or(())?;
        let urlenc = letter.is_ascii_uppercase();
        let letter = letter.to_ascii_lowercase();

        let mut num = None;
        let mut digits = String::new();
        while let Some(c) = it.peek().copied() {
            if c.is_ascii_digit() {
                digits.push(c);
                it.next();
            } else {
                break;
            }
        }
        if !digits.is_empty() {
            let n: usize = digits.parse().map_err(|_| ())?;
            if n == 0 {
                return Err(());
            }
            num = Some(n);
        }
        let reverse = it.peek() == Some(&'r');
        if reverse {
            it.next();
        }
        let mut delims = String::new();
        for c in it {
            if SPF_DELIMITERS.contains(c) {
                delims.push(c);
            } else {
                return Err(());
            }
        }
        if delims.is_empty() {
            delims.push('.');
        }

        let source = match letter {
            's' => match self.sender {
                Some(m) => m.address(),
                None => format!("postmaster@{}", self.helo),
            },
            'l' => match self.sender {
                Some(m) => m.local.clone(),
                None => "postmaster".to_owned(),
            },
            'o' => match self.sender {
                Some(m) => m.domain.clone(),
                None => self.helo.to_owned(),
            },
            'd' => domain.to_owned(),
            'i' => {
                if is_v4_mapped(&self.remote_ip) {
                    match self.remote_ip.to_ipv4() {
                        Some(v4) => v4.to_string(),
                        None => return Err(()),
                    }
                } else {
                    dot_nibbles(&self.remote_ip)
                }
            }
            'p' => self
                .remote_host
                .map(|h| h.to_owned())
                .unwrap_or_else(|| "unknown".to_owned()),
            'v' => {
                if is_v4_mapped(&self.remote_ip) {
                    "in-addr".to_owned()
                } else {
                    "ip6".to_owned()
                }
            }
            'h' => self.helo.to_owned(),
            'c' if in_exp => {
                if is_v4_mapped(&self.remote_ip) {
                    match self.remote_ip.to_ipv4() {
                        Some(v4) => v4.to_string(),
                        None => return Err(()),
                    }
                } else {
                    self.remote_ip.to_string()
                }
            }
            'r' if in_exp => self.my_helo.to_owned(),
            't' if in_exp => chrono::Utc::now().timestamp().to_string(),
            _ => return Err(()),
        };

        Ok(transform(&source, num, reverse, &delims, urlenc))
    }
}

fn split_qualifier(token: &str) -> (SpfVerdict, &str) {
    match token.as_bytes().first() {
        Some(b'+') => (SpfVerdict::Pass, &token[1..]),
        Some(b'-') => (SpfVerdict::Fail, &token[1..]),
        Some(b'~') => (SpfVerdict::SoftFail, &token[1..]),
        Some(b'?') => (SpfVerdict::Neutral, &token[1..]),
        _ => (SpfVerdict::Pass, token),
    }
}

fn modifier<'t>(token: &'t str, name: &str) -> Option<&'t str> {
    let eq = token.find('=')?;
    if token[..eq].eq_ignore_ascii_case(name) {
        Some(&token[eq + 1..])
    } else {
        None
    }
}

fn prefixed<'t>(lower: &str, token: &'t str, prefix: &str) -> Option<&'t str> {
    if lower.starts_with(prefix) {
        Some(&token[prefix.len()..])
    } else {
        None
    }
}

fn after_name(mech: &str, name_len: usize) -> &str {
    &mech[name_len..]
}

/// Split off the dual-CIDR suffix, skipping over `/` inside `%{...}`
/// macro groups.
fn split_cidr(rest: &str) -> (&str, &str) {
    let mut in_braces = false;
    let mut prev = '\0';
    for (i, c) in rest.char_indices() {
        match c {
            '{' if prev == '%' => in_braces = true,
            '}' => in_braces = false,
            '/' if !in_braces => return (&rest[..i], &rest[i..]),
            _ => {}
        }
        prev = c;
    }
    (rest, "")
}

fn parse_dual_cidr(raw: &str) -> Result<(Option<u8>, Option<u8>), ()> {
    if raw.is_empty() {
        return Ok((None, None));
    }
    if let Some(six) = raw.strip_prefix("//") {
        let n: u8 = six.parse().map_err(|_| ())?;
        if !(8..=128).contains(&n) {
            return Err(());
        }
        return Ok((None, Some(n)));
    }
    let rest = raw.strip_prefix('/').ok_or(())?;
    let (four, six) = match rest.find("//") {
        None => (rest, None),
        Some(p) => (&rest[..p], Some(&rest[p + 2..])),
    };
    let c4: u8 = four.parse().map_err(|_| ())?;
    if !(8..=32).contains(&c4) {
        return Err(());
    }
    let c6 = match six {
        None => None,
        Some(s) => {
            let n: u8 = s.parse().map_err(|_| ())?;
            if !(8..=128).contains(&n) {
                return Err(());
            }
            Some(n)
        }
    };
    Ok((Some(c4), c6))
}

fn dot_nibbles(ip: &Ipv6Addr) -> String {
    let mut out = String::with_capacity(63);
    for b in ip.octets().iter() {
        if !out.is_empty() {
            out.push('.');
        }
        out.push(std::char::from_digit(u32::from(b >> 4), 16).unwrap_or('0'));
        out.push('.');
        out.push(std::char::from_digit(u32::from(b & 0xf), 16).unwrap_or('0'));
    }
    out
}

fn transform(source: &str, num: Option<usize>, reverse: bool, delims: &str, urlenc: bool) -> String {
    let mut labels: Vec<&str> = source.split(|c| delims.contains(c)).collect();
    if reverse {
        labels.reverse();
    }
    if let Some(n) = num {
        if n < labels.len() {
            labels.drain(..labels.len() - n);
        }
    }
    let joined = labels.join(".");
    if urlenc {
        urlencode(&joined)
    } else {
        joined
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'!' | b'~' | b'*'
            | b'\'' | b'(' | b')' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Render the `Received-SPF:` header line for the DATA phase.
pub fn received_spf(outcome: &SpfOutcome, my_helo: &str, fromdomain: &str) -> String {
    match outcome.verdict {
        SpfVerdict::PermError => format!(
            "Received-SPF: {}: syntax error while parsing SPF entry for {}",
            my_helo, fromdomain
        ),
        SpfVerdict::TempError => format!(
            "Received-SPF: {}: can't get SPF entry for {} (DNS problem)",
            my_helo, fromdomain
        ),
        SpfVerdict::None => format!(
            "Received-SPF: {}: no SPF entry for {}",
            my_helo, fromdomain
        ),
        v => format!(
            "Received-SPF: {}: SPF status for {} is {}",
            my_helo,
            fromdomain,
            v.as_str().to_ascii_uppercase()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use smtp_dns::{map_v4, StaticDns};

    fn ctx<'a>(dns: &'a StaticDns, sender: &'a Mailbox) -> SpfContext<'a> {
        SpfContext {
            dns,
            remote_ip: map_v4("192.0.2.2".parse().unwrap()),
            remote_host: Some("mx.sender.example"),
            helo: "mx.sender.example",
            my_helo: "mail.local.example",
            sender: Some(sender),
        }
    }

    fn sender() -> Mailbox {
        Mailbox {
            local: "bob".into(),
            domain: "sender.example".into(),
        }
    }

    #[test]
    fn ip4_mechanism_passes_and_fails() {
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 ip4:192.0.2.0/24 -all"]);
        let s = sender();
        let c = ctx(&dns, &s);
        assert_eq!(block_on(c.check_host("sender.example")).verdict, SpfVerdict::Pass);

        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 ip4:198.51.100.0/24 -all"]);
        let c = ctx(&dns, &s);
        let outcome = block_on(c.check_host("sender.example"));
        assert_eq!(outcome.verdict, SpfVerdict::Fail);
    }

    #[test]
    fn softfail_and_neutral_qualifiers() {
        let s = sender();
        let dns = StaticDns::default().with_txt("sender.example", &["v=spf1 ~all"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::SoftFail
        );
        let dns = StaticDns::default().with_txt("sender.example", &["v=spf1 ?all"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::Neutral
        );
    }

    #[test]
    fn no_record_is_none_and_two_records_are_permerror() {
        let s = sender();
        let dns = StaticDns::default().with_txt("sender.example", &["unrelated txt"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::None
        );
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 -all", "v=spf1 +all"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::PermError
        );
    }

    #[test]
    fn include_cycle_is_permerror() {
        let s = sender();
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 include:sender.example"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::PermError
        );
    }

    #[test]
    fn redirect_cycle_is_permerror() {
        let s = sender();
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 redirect=other.example"])
            .with_txt("other.example", &["v=spf1 redirect=sender.example"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::PermError
        );
    }

    #[test]
    fn include_of_recordless_domain_is_permerror() {
        let s = sender();
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 include:empty.example"])
            .with_txt("empty.example", &["no spf here"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::PermError
        );
    }

    #[test]
    fn a_mechanism_with_cidr() {
        let s = sender();
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 a/24 -all"])
            .with_a("sender.example", &["192.0.2.77"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::Pass
        );
    }

    #[test]
    fn mx_mechanism_ignores_synthesized_lists() {
        let s = sender();
        // no MX records: the AAAA fallback must not satisfy `mx`
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 mx -all"])
            .with_a("sender.example", &["192.0.2.2"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::Fail
        );

        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 mx -all"])
            .with_mx("sender.example", &[(10, "mx.sender.example")])
            .with_a("mx.sender.example", &["192.0.2.2"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::Pass
        );
    }

    #[test]
    fn exists_uses_a_only_with_macros() {
        let s = sender();
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 exists:%{ir}.%{v}.check.example -all"])
            .with_a("2.2.0.192.in-addr.check.example", &["127.0.0.2"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::Pass
        );

        // AAAA on the probe name must not count
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 exists:%{ir}.%{v}.check.example -all"])
            .with_aaaa("2.2.0.192.in-addr.check.example", &["2001:db8::1"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::Fail
        );
    }

    #[test]
    fn fail_collects_the_explanation() {
        let s = sender();
        let dns = StaticDns::default().with_txt(
            "sender.example",
            &["v=spf1 -all exp=%{l}%_is%_not%_allowed%_from%_%{i}"],
        );
        let outcome = block_on(ctx(&dns, &s).check_host("sender.example"));
        assert_eq!(outcome.verdict, SpfVerdict::Fail);
        assert_eq!(
            outcome.explanation.as_deref(),
            Some("bob is not allowed from 192.0.2.2")
        );
    }

    #[test]
    fn bounce_uses_postmaster_at_helo() {
        let dns = StaticDns::default()
            .with_txt("mx.sender.example", &["v=spf1 exists:%{s}.check.example -all"])
            .with_a("postmaster@mx.sender.example.check.example", &["127.0.0.2"]);
        let c = SpfContext {
            dns: &dns,
            remote_ip: map_v4("192.0.2.2".parse().unwrap()),
            remote_host: None,
            helo: "mx.sender.example",
            my_helo: "mail.local.example",
            sender: None,
        };
        assert_eq!(block_on(c.check_host("mx.sender.example")).verdict, SpfVerdict::Pass);
    }

    #[test]
    fn macro_digit_and_reverse_transforms() {
        let s = sender();
        let dns = StaticDns::default();
        let c = ctx(&dns, &s);
        assert_eq!(c.expand("%{d2}", "a.b.c.example", false).unwrap(), "c.example");
        assert_eq!(c.expand("%{dr}", "a.b.c", false).unwrap(), "c.b.a");
        assert_eq!(c.expand("%{o}", "x.example", false).unwrap(), "sender.example");
        assert_eq!(c.expand("%{h}", "x.example", false).unwrap(), "mx.sender.example");
        assert_eq!(c.expand("%%%-%_", "x.example", false).unwrap(), "%%20 ");
        assert!(c.expand("%{z}", "x.example", false).is_err());
        assert!(c.expand("%{s0}", "x.example", false).is_err());
    }

    #[test]
    fn uppercase_macro_urlencodes() {
        let s = Mailbox {
            local: "bob+tag".into(),
            domain: "sender.example".into(),
        };
        let dns = StaticDns::default();
        let c = ctx(&dns, &s);
        assert_eq!(
            c.expand("%{L}", "x.example", true).unwrap(),
            "bob%2Btag"
        );
    }

    #[test]
    fn malformed_helo_fails_for_bounces() {
        let dns = StaticDns::default();
        let c = SpfContext {
            dns: &dns,
            remote_ip: map_v4("192.0.2.2".parse().unwrap()),
            remote_host: None,
            helo: "[192.0.2.2]",
            my_helo: "mail.local.example",
            sender: None,
        };
        assert_eq!(block_on(c.check_host("[192.0.2.2]")).verdict, SpfVerdict::Fail);
    }

    #[test]
    fn bad_cidr_is_permerror() {
        let s = sender();
        let dns = StaticDns::default()
            .with_txt("sender.example", &["v=spf1 ip4:192.0.2.0/2 -all"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::PermError
        );
        let dns = StaticDns::default().with_txt("sender.example", &["v=spf1 a//200 -all"]);
        assert_eq!(
            block_on(ctx(&dns, &s).check_host("sender.example")).verdict,
            SpfVerdict::PermError
        );
    }
}
