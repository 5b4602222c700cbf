//! The per-recipient policy callback chain.
//!
//! Callbacks run in fixed order and the first one that does not pass
//! stops the chain. The session applies the `fail_hard_on_temp` and
//! `nonexist_on_block` rewrites to the verdict before replying.

use std::{io, net::Ipv6Addr, path::Path};

use smtp_dns::{Dns, DnsError};
use smtp_wire::domain_valid;
use tracing::info;

use crate::{
    spf::{SpfContext, SpfVerdict},
    userconf::{Scope, Userconf},
    xmit::Transmission,
};

/// Verdict of one callback (and of the whole chain).
pub enum Filter {
    Passed,
    /// Permanent rejection; `reply` is the full reply line to send.
    Denied { reply: String, log: String },
    /// Temporary rejection; `hard_reply` is what it becomes under
    /// `fail_hard_on_temp`.
    DeniedTemp {
        reply: String,
        hard_reply: String,
        log: String,
    },
}

pub struct FilterCtx<'a> {
    pub uc: &'a Userconf,
    /// The global scope for file lookups (the control directory).
    pub control_dir: &'a Path,
    /// control/filterconf lines, the global scope for settings.
    pub global_conf: Option<&'a [String]>,
    pub dns: &'a dyn Dns,
    pub xmit: &'a Transmission,
    pub my_helo: &'a str,
}

/// Run every callback in order; the first non-pass wins.
pub async fn run_filters(ctx: &FilterCtx<'_>) -> io::Result<Filter> {
    match cb_helo(ctx)? {
        Filter::Passed => {}
        other => return Ok(other),
    }
    match cb_dnsbl(ctx).await? {
        Filter::Passed => {}
        other => return Ok(other),
    }
    match cb_rhsbl(ctx).await? {
        Filter::Passed => {}
        other => return Ok(other),
    }
    match cb_spf(ctx).await? {
        Filter::Passed => {}
        other => return Ok(other),
    }
    Ok(Filter::Passed)
}

fn temp_dns_verdict(log: &str) -> Filter {
    Filter::DeniedTemp {
        reply: "450 4.7.0 mail temporary denied for policy reasons".into(),
        hard_reply: "550 5.7.1 mail denied for policy reasons".into(),
        log: log.into(),
    }
}

/// Reject odd HELO values per the `helovalid` bitmask setting.
fn cb_helo(ctx: &FilterCtx<'_>) -> io::Result<Filter> {
    let (setting, _) = ctx.uc.get_setting_global(ctx.global_conf, "helovalid");
    if setting <= 0 {
        return Ok(Filter::Passed);
    }
    let helo = match &ctx.xmit.helo {
        None => return Ok(Filter::Passed),
        Some(h) => h,
    };
    if i64::from(helo.status) & setting != 0 {
        return Ok(Filter::Denied {
            reply: "550 5.7.1 invalid HELO".into(),
            log: "bad helo".into(),
        });
    }
    Ok(Filter::Passed)
}

/// The label the blocked address is queried under: reversed octets for
/// IPv4, reversed nibbles for IPv6.
fn reverse_ip_labels(ip: &Ipv6Addr, mapped: bool) -> String {
    if mapped {
        match ip.to_ipv4() {
            Some(v4) => {
                let o = v4.octets();
                return format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0]);
            }
            None => {}
        }
    }
    let mut out = String::with_capacity(63);
    for b in ip.octets().iter().rev() {
        if !out.is_empty() {
            out.push('.');
        }
        out.push(std::char::from_digit(u32::from(b & 0xf), 16).unwrap_or('0'));
        out.push('.');
        out.push(std::char::from_digit(u32::from(b >> 4), 16).unwrap_or('0'));
    }
    out
}

async fn cb_dnsbl(ctx: &FilterCtx<'_>) -> io::Result<Filter> {
    let (bl_key, wl_key) = if ctx.xmit.ipv4_mapped {
        ("dnsbl", "whitednsbl")
    } else {
        ("dnsblv6", "whitednsblv6")
    };
    let (zones, scope) = match ctx.uc.get_list(Some(ctx.control_dir), bl_key, true)? {
        None => return Ok(Filter::Passed),
        Some(z) => z,
    };
    let rev = reverse_ip_labels(&ctx.xmit.remote_ip, ctx.xmit.ipv4_mapped);

    for zone in zones.iter().filter(|z| domain_valid(z)) {
        let query = format!("{}.{}", rev, zone);
        match ctx.dns.a(&query).await {
            Ok(addrs) if !addrs.is_empty() => {
                // a whitelist hit overrides the listing
                if let Some((white, wscope)) = ctx.uc.get_list(None, wl_key, true)? {
                    for wzone in white.iter().filter(|z| domain_valid(z)) {
                        let wquery = format!("{}.{}", rev, wzone);
                        if matches!(ctx.dns.a(&wquery).await, Ok(ref a) if !a.is_empty()) {
                            info!(
                                "not rejected message from IP [{}] {{listed in {} from {} dnsbl, \
                                 but whitelisted by {} from {} whitelist}}",
                                ctx.xmit.remote_ip_str,
                                zone,
                                scope.as_str(),
                                wzone,
                                wscope.as_str()
                            );
                            return Ok(Filter::Passed);
                        }
                    }
                }
                let mut reply = format!("501 5.7.1 message rejected, you are listed in {}", zone);
                if let Ok(txts) = ctx.dns.txt(&query).await {
                    if let Some(t) = txts.first() {
                        reply.push_str(", message: ");
                        reply.push_str(t);
                    }
                }
                return Ok(Filter::Denied {
                    reply,
                    log: format!("listed in {} from {} dnsbl", zone, scope.as_str()),
                });
            }
            Ok(_) | Err(DnsError::NoRecord) | Err(DnsError::PermFail) => continue,
            Err(DnsError::TempFail) => {
                return Ok(temp_dns_verdict("temporary DNS error on RBL lookup"))
            }
        }
    }
    Ok(Filter::Passed)
}

async fn cb_rhsbl(ctx: &FilterCtx<'_>) -> io::Result<Filter> {
    let fromdomain = match &ctx.xmit.mail_from {
        None => return Ok(Filter::Passed),
        Some(m) => &m.domain,
    };
    let (zones, scope) = match ctx.uc.get_list(Some(ctx.control_dir), "rhsbl", true)? {
        None => return Ok(Filter::Passed),
        Some(z) => z,
    };
    for zone in zones.iter().filter(|z| domain_valid(z)) {
        let query = format!("{}.{}", fromdomain, zone);
        match ctx.dns.a(&query).await {
            Ok(addrs) if !addrs.is_empty() => {
                if let Some((white, wscope)) = ctx.uc.get_list(None, "whiterhsbl", true)? {
                    for wzone in white.iter().filter(|z| domain_valid(z)) {
                        let wquery = format!("{}.{}", fromdomain, wzone);
                        if matches!(ctx.dns.a(&wquery).await, Ok(ref a) if !a.is_empty()) {
                            info!(
                                "not rejected message from <{}> {{listed in {}, but whitelisted \
                                 by {} from {} whitelist}}",
                                ctx.xmit.sender_display(),
                                zone,
                                wzone,
                                wscope.as_str()
                            );
                            return Ok(Filter::Passed);
                        }
                    }
                }
                return Ok(Filter::Denied {
                    reply: format!(
                        "550 5.7.1 message rejected, your sender domain is listed in {}",
                        zone
                    ),
                    log: format!("listed in {} from {} rhsbl", zone, scope.as_str()),
                });
            }
            Ok(_) | Err(DnsError::NoRecord) | Err(DnsError::PermFail) => continue,
            Err(DnsError::TempFail) => {
                return Ok(temp_dns_verdict("temporary DNS error on RHSBL lookup"))
            }
        }
    }
    Ok(Filter::Passed)
}

/// Map the SPF verdict through the `spfpolicy` level:
/// 1 temp errors only, 2 +fail, 3 +permerror, 4 +softfail, 5 +neutral,
/// 6 +none. `spfignore` (matched against the reverse-DNS name) forces a
/// pass, `rspf` supplies secondary records for domains without one, and
/// `spfstrict` still rejects record-less domains.
async fn cb_spf(ctx: &FilterCtx<'_>) -> io::Result<Filter> {
    let mut verdict = match &ctx.xmit.spf {
        None => return Ok(Filter::Passed),
        Some(o) => o.verdict,
    };
    if verdict == SpfVerdict::Pass {
        return Ok(Filter::Passed);
    }
    let (policy, _) = ctx.uc.get_setting_global(ctx.global_conf, "spfpolicy");
    if policy <= 0 {
        return Ok(Filter::Passed);
    }

    if let Some(rh) = &ctx.xmit.remote_host {
        let sc = ctx.uc.find_domain(Some(ctx.control_dir), "spfignore", rh)?;
        if sc != Scope::None {
            info!(
                "not rejected message from IP [{}] {{SPF whitelisted by {} spfignore}}",
                ctx.xmit.remote_ip_str,
                sc.as_str()
            );
            return Ok(Filter::Passed);
        }
    }

    let fromdomain = ctx.xmit.spf_domain();
    let mut logmsg = "SPF";

    // no official record: try the locally configured secondary sources
    if verdict == SpfVerdict::None {
        if let Some((rspf, _)) = ctx.uc.get_list(Some(ctx.control_dir), "rspf", true)? {
            let sctx = SpfContext {
                dns: ctx.dns,
                remote_ip: ctx.xmit.remote_ip,
                remote_host: ctx.xmit.remote_host.as_deref(),
                helo: ctx.xmit.helo_str(),
                my_helo: ctx.my_helo,
                sender: ctx.xmit.mail_from.as_ref(),
            };
            let mut olderror = SpfVerdict::None;
            for zone in rspf.iter().filter(|z| domain_valid(z)) {
                if !matches!(
                    verdict,
                    SpfVerdict::None | SpfVerdict::TempError | SpfVerdict::PermError
                ) {
                    break;
                }
                if verdict != SpfVerdict::None && olderror == SpfVerdict::None {
                    olderror = verdict;
                }
                let query = format!("{}.{}", fromdomain, zone);
                verdict = sctx.check_host(&query).await.verdict;
            }
            match verdict {
                SpfVerdict::Pass => return Ok(Filter::Passed),
                SpfVerdict::PermError => verdict = SpfVerdict::None,
                _ => {
                    if verdict == SpfVerdict::None {
                        verdict = olderror;
                    }
                    if verdict != SpfVerdict::None {
                        logmsg = "rSPF";
                    }
                }
            }
        }
    }

    let strict = |verdict_now: SpfVerdict| -> io::Result<Filter> {
        let sc = ctx
            .uc
            .find_domain(Some(ctx.control_dir), "spfstrict", &fromdomain)?;
        if sc == Scope::None {
            Ok(Filter::Passed)
        } else {
            Ok(block(ctx, verdict_now, logmsg))
        }
    };

    if verdict == SpfVerdict::TempError {
        return Ok(Filter::DeniedTemp {
            reply: "451 4.4.3 temporary error when checking the SPF policy".into(),
            hard_reply: "550 5.7.1 mail denied by SPF policy".into(),
            log: "temp SPF".into(),
        });
    }
    if policy == 1 {
        return strict(verdict);
    }
    if verdict == SpfVerdict::Fail {
        return Ok(block(ctx, verdict, logmsg));
    }
    if policy == 2 {
        return strict(verdict);
    }
    if verdict == SpfVerdict::PermError {
        return Ok(Filter::Denied {
            reply: "550 5.5.2 syntax error in SPF record".into(),
            log: "bad SPF".into(),
        });
    }
    if policy == 3 {
        return strict(verdict);
    }
    if verdict == SpfVerdict::SoftFail {
        return Ok(block(ctx, verdict, logmsg));
    }
    if policy == 4 {
        return strict(verdict);
    }
    if verdict == SpfVerdict::Neutral {
        return Ok(block(ctx, verdict, logmsg));
    }
    if policy == 5 {
        return strict(verdict);
    }
    // only None reaches policy level 6
    Ok(block(ctx, verdict, logmsg))
}

fn block(ctx: &FilterCtx<'_>, verdict: SpfVerdict, logmsg: &str) -> Filter {
    let mut reply = String::from("550 5.7.1 mail denied by SPF policy");
    if verdict != SpfVerdict::PermError {
        if let Some(exp) = ctx.xmit.spf.as_ref().and_then(|o| o.explanation.as_deref()) {
            reply.push_str(", SPF record says: ");
            reply.push_str(exp);
        }
    }
    Filter::Denied {
        reply,
        log: logmsg.into(),
    }
}
