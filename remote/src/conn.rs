//! Target resolution and connection: literal addresses, the smtproutes
//! override, MX lists, and per-candidate connect with state marking.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    os::unix::io::FromRawFd,
    path::Path,
    time::Duration,
};

use smtp_dns::{host_addrs, is_v4_mapped, mx_list, unmap, Dns, DnsError, MxCandidate, MxList};
use tracing::warn;

use crate::TransportError;

pub const SMTP_PORT: u16 = 25;

/// Where the session should go: the candidate list plus the port (which
/// only smtproutes can override).
pub struct Route {
    pub list: MxList,
    pub port: u16,
}

fn literal_route(literal: &str) -> Result<Route, TransportError> {
    let inner = &literal[1..literal.len() - 1];
    let addr = if let Ok(v6) = inner.parse::<Ipv6Addr>() {
        v6
    } else if let Ok(v4) = inner.parse::<Ipv4Addr>() {
        v4.to_ipv6_mapped()
    } else {
        return Err(TransportError::BadLiteral);
    };
    Ok(Route {
        list: MxList::single(addr),
        port: SMTP_PORT,
    })
}

/// One smtproutes entry: `pattern:relay[:port]`; an empty pattern
/// matches everything, a leading dot only proper subdomains.
fn route_entry<'a>(entry: &'a str, host: &str) -> Option<(&'a str, Option<u16>)> {
    let mut fields = entry.splitn(3, ':');
    let pattern = fields.next()?;
    let relay = fields.next()?;
    let port = fields.next().and_then(|p| p.parse().ok());
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    let matched = pattern.is_empty()
        || host == pattern
        || (pattern.starts_with('.') && host.ends_with(&pattern))
        || host.ends_with(&format!(".{}", pattern));
    if matched && !relay.is_empty() {
        Some((relay, port))
    } else {
        None
    }
}

fn read_smtproutes(control: &Path) -> Vec<String> {
    match std::fs::read_to_string(control.join("smtproutes")) {
        Ok(content) => content
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.to_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Build the candidate list for the target: literal, routed, or MX.
pub async fn get_route(
    dns: &dyn Dns,
    remhost: &str,
    control: &Path,
) -> Result<Route, TransportError> {
    if remhost.starts_with('[') {
        if !remhost.ends_with(']') {
            return Err(TransportError::BadLiteral);
        }
        return literal_route(remhost);
    }

    for entry in read_smtproutes(control) {
        if let Some((relay, port)) = route_entry(&entry, remhost) {
            let addrs = host_addrs(dns, relay)
                .await
                .map_err(|_| TransportError::NoMx(relay.to_owned()))?;
            let mut list = MxList::default();
            for a in addrs {
                list.push(MxCandidate::new(a, 0, Some(relay.to_owned())));
            }
            return Ok(Route {
                list,
                port: port.unwrap_or(SMTP_PORT),
            });
        }
    }

    let mut list = match mx_list(dns, remhost).await {
        Ok(l) => l,
        Err(DnsError::NoRecord) | Err(DnsError::TempFail) | Err(DnsError::PermFail) => {
            return Err(TransportError::NoMx(remhost.to_owned()))
        }
    };
    list.sort();
    Ok(Route {
        list,
        port: SMTP_PORT,
    })
}

fn bind_v4(fd: libc::c_int, ip: Ipv4Addr) -> io::Result<()> {
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bind_v6(fd: libc::c_int, ip: Ipv6Addr) -> io::Result<()> {
    let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    addr.sin6_addr = libc::in6_addr {
        s6_addr: ip.octets(),
    };
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Bind the configured outgoing address (when any) and connect. std has
/// no bind-before-connect, so this goes through the raw socket calls.
fn connect_from(
    outip: Option<IpAddr>,
    target: IpAddr,
    port: u16,
) -> io::Result<std::net::TcpStream> {
    let family = match target {
        IpAddr::V4(_) => libc::AF_INET,
        IpAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let res = (|| -> io::Result<()> {
        match outip {
            Some(IpAddr::V4(local)) if family == libc::AF_INET => bind_v4(fd, local)?,
            Some(IpAddr::V6(local)) if family == libc::AF_INET6 => bind_v6(fd, local)?,
            _ => {}
        }
        let rc = match target {
            IpAddr::V4(v4) => {
                let addr = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: port.to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    libc::connect(
                        fd,
                        &addr as *const _ as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            IpAddr::V6(v6) => {
                let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                addr.sin6_port = port.to_be();
                addr.sin6_addr = libc::in6_addr {
                    s6_addr: v6.octets(),
                };
                unsafe {
                    libc::connect(
                        fd,
                        &addr as *const _ as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
            }
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    })();

    match res {
        Ok(()) => Ok(unsafe { std::net::TcpStream::from_raw_fd(fd) }),
        Err(e) => {
            unsafe {
                libc::close(fd);
            }
            Err(e)
        }
    }
}

/// Try candidates in list order until a TCP connection succeeds. The
/// winner is marked `Active`, everything tried before it `Attempted`.
pub async fn try_connect(
    list: &mut MxList,
    outip: Option<Ipv6Addr>,
    port: u16,
    timeout: Duration,
) -> Result<smol::Async<std::net::TcpStream>, TransportError> {
    loop {
        let idx = match list.next_fresh() {
            None => return Err(TransportError::NoConnection),
            Some(i) => i,
        };
        let addr = match list.iter().nth(idx) {
            None => return Err(TransportError::NoConnection),
            Some(c) => c.addr,
        };
        let target = unmap(&addr);
        let local = outip.map(|ip| {
            if is_v4_mapped(&ip) && matches!(target, IpAddr::V4(_)) {
                unmap(&ip)
            } else {
                IpAddr::V6(ip)
            }
        });
        // outgoing v6 address cannot bind a v4 socket; skip the bind then
        let local = match (local, &target) {
            (Some(IpAddr::V6(_)), IpAddr::V4(_)) => None,
            (l, _) => l,
        };

        let attempt = smol::unblock(move || connect_from(local, target, port));
        let connected = smol::future::or(
            async { Some(attempt.await) },
            async {
                smol::Timer::after(timeout).await;
                None
            },
        )
        .await;

        match connected {
            Some(Ok(stream)) => match smol::Async::new(stream) {
                Ok(async_stream) => {
                    list.activate(idx);
                    return Ok(async_stream);
                }
                Err(e) => {
                    warn!("cannot register connection: {}", e);
                    list.mark_attempted(idx);
                }
            },
            Some(Err(e)) => {
                warn!("connect to {} failed: {}", target, e);
                list.mark_attempted(idx);
            }
            None => {
                warn!("connect to {} timed out", target);
                list.mark_attempted(idx);
            }
        }
    }
}
