use std::net::Ipv6Addr;

/// Priority given to candidates synthesized from AAAA/A records when the
/// target has no MX at all. A real MX preference is 16 bits, so explicit
/// records always rank ahead of these.
pub const SYNTHESIZED_PRIORITY: u32 = 65536;

/// Connection bookkeeping for one candidate. Exactly one candidate is
/// `Active` at any time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    Fresh,
    Attempted,
    Active,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MxCandidate {
    pub addr: Ipv6Addr,
    pub priority: u32,
    pub state: ConnState,
    /// The exchange (or target host) this address came from.
    pub name: Option<String>,
}

impl MxCandidate {
    pub fn new(addr: Ipv6Addr, priority: u32, name: Option<String>) -> MxCandidate {
        MxCandidate {
            addr,
            priority,
            state: ConnState::Fresh,
            name,
        }
    }
}

/// An owned list of connection candidates in resolver order until
/// [`sort`](MxList::sort) is called.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MxList {
    entries: Vec<MxCandidate>,
}

impl MxList {
    pub fn single(addr: Ipv6Addr) -> MxList {
        MxList {
            entries: vec![MxCandidate::new(addr, 0, None)],
        }
    }

    pub fn synthesized(host: &str, addrs: Vec<Ipv6Addr>) -> MxList {
        MxList {
            entries: addrs
                .into_iter()
                .map(|a| MxCandidate::new(a, SYNTHESIZED_PRIORITY, Some(host.to_owned())))
                .collect(),
        }
    }

    pub fn push(&mut self, c: MxCandidate) {
        self.entries.push(c);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MxCandidate> {
        self.entries.iter()
    }

    /// Stable ascending sort by priority; equal priorities keep resolver
    /// order.
    pub fn sort(&mut self) {
        self.entries.sort_by_key(|c| c.priority);
    }

    /// Whether this list was synthesized from address records. MX-implicit
    /// lists are all-or-nothing, so only the head needs checking.
    pub fn is_synthesized(&self) -> bool {
        self.entries
            .first()
            .map(|c| c.priority >= SYNTHESIZED_PRIORITY)
            .unwrap_or(false)
    }

    /// Index of the next candidate worth trying.
    pub fn next_fresh(&self) -> Option<usize> {
        self.entries.iter().position(|c| c.state == ConnState::Fresh)
    }

    /// Demote the currently active candidate (if any) and mark `idx` as
    /// the one being connected to.
    pub fn activate(&mut self, idx: usize) {
        for c in &mut self.entries {
            if c.state == ConnState::Active {
                c.state = ConnState::Attempted;
            }
        }
        self.entries[idx].state = ConnState::Active;
    }

    pub fn mark_attempted(&mut self, idx: usize) {
        self.entries[idx].state = ConnState::Attempted;
    }

    pub fn active(&self) -> Option<&MxCandidate> {
        self.entries.iter().find(|c| c.state == ConnState::Active)
    }
}
