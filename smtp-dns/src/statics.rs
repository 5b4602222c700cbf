use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr},
};

use async_trait::async_trait;

use crate::{map_v4, Dns, DnsError};

/// In-memory resolver for tests: every name that was not registered
/// resolves to [`DnsError::NoRecord`], and names can be forced to fail
/// with a chosen error class.
#[derive(Default)]
pub struct StaticDns {
    mx: HashMap<String, Vec<(u16, String)>>,
    aaaa: HashMap<String, Vec<Ipv6Addr>>,
    a: HashMap<String, Vec<Ipv6Addr>>,
    ptr: HashMap<Ipv6Addr, String>,
    txt: HashMap<String, Vec<String>>,
    failing: HashMap<String, DnsError>,
}

impl StaticDns {
    pub fn with_mx(mut self, host: &str, records: &[(u16, &str)]) -> Self {
        self.mx.insert(
            host.to_owned(),
            records.iter().map(|(p, n)| (*p, (*n).to_owned())).collect(),
        );
        self
    }

    pub fn with_aaaa(mut self, host: &str, addrs: &[&str]) -> Self {
        self.aaaa.insert(
            host.to_owned(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }

    pub fn with_a(mut self, host: &str, addrs: &[&str]) -> Self {
        self.a.insert(
            host.to_owned(),
            addrs
                .iter()
                .map(|a| map_v4(a.parse::<Ipv4Addr>().unwrap()))
                .collect(),
        );
        self
    }

    pub fn with_ptr(mut self, ip: &str, name: &str) -> Self {
        self.ptr.insert(ip.parse().unwrap(), name.to_owned());
        self
    }

    pub fn with_txt(mut self, host: &str, records: &[&str]) -> Self {
        self.txt.insert(
            host.to_owned(),
            records.iter().map(|r| (*r).to_owned()).collect(),
        );
        self
    }

    pub fn with_failure(mut self, host: &str, e: DnsError) -> Self {
        self.failing.insert(host.to_owned(), e);
        self
    }

    fn check_failure(&self, host: &str) -> Result<(), DnsError> {
        match self.failing.get(host) {
            Some(e) => Err(*e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Dns for StaticDns {
    async fn mx(&self, host: &str) -> Result<Vec<(u16, String)>, DnsError> {
        self.check_failure(host)?;
        self.mx.get(host).cloned().ok_or(DnsError::NoRecord)
    }

    async fn aaaa(&self, host: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.check_failure(host)?;
        self.aaaa.get(host).cloned().ok_or(DnsError::NoRecord)
    }

    async fn a(&self, host: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.check_failure(host)?;
        self.a.get(host).cloned().ok_or(DnsError::NoRecord)
    }

    async fn ptr(&self, ip: &Ipv6Addr) -> Result<String, DnsError> {
        self.ptr.get(ip).cloned().ok_or(DnsError::NoRecord)
    }

    async fn txt(&self, host: &str) -> Result<Vec<String>, DnsError> {
        self.check_failure(host)?;
        self.txt.get(host).cloned().ok_or(DnsError::NoRecord)
    }
}
