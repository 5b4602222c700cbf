//! Recipient-domain routing and the seam to the local user store.

use std::io;

use smtp_wire::Mailbox;

use crate::userconf::Userconf;

pub const MAX_RCPT: usize = 500;

/// The five-way outcome of probing a local address against the mailbox
/// store layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UserExists {
    /// The domain is in rcpthosts but is not a vpopmail domain here;
    /// accept and let the next backend sort it out.
    NotVpop,
    /// The user directory exists.
    Deliverable,
    /// A `.qmail-<localpart>[-default]` file routes this address.
    MailingList,
    /// A `.qmail-<prefix>-default` catch-all matched a dash prefix.
    PrefixDefault,
    /// `.qmail-default` exists and is not the bounce command.
    CatchAll,
    /// Nothing routes this address.
    NoSuchUser,
}

impl UserExists {
    pub fn accepts(self) -> bool {
        !matches!(self, UserExists::NoSuchUser)
    }
}

/// Local user store: recipient-domain routing plus existence probing.
/// The production implementation is [`crate::vpop::VpopBackend`]; tests
/// substitute their own.
pub trait UserBackend: Send + Sync {
    /// Whether we accept mail for this domain at all (rcpthosts plus the
    /// morercpthosts cdb).
    fn local_domain(&self, domain: &str) -> io::Result<bool>;

    /// Probe a localpart under a local domain, returning the decision and
    /// the per-recipient config handles for the policy callbacks.
    fn probe(&self, local: &str, domain: &str) -> io::Result<(UserExists, Userconf)>;
}

/// What the RCPT/MAIL address pipeline decided, before policy callbacks.
pub enum AddrOutcome {
    /// Syntactically fine and routable; `mailbox` is `None` for bounces
    /// and bare postmaster.
    Accepted {
        mailbox: Option<Mailbox>,
        exists: UserExists,
        uc: Userconf,
    },
    /// Domain is not one of ours: relay decision needed for RCPT, plain
    /// accept for MAIL.
    NotLocal { mailbox: Mailbox },
    /// Domain is ours but nothing routes the address.
    NoSuchUser { mailbox: Mailbox },
}

/// Route one parsed mailbox through the backend.
pub fn resolve(backend: &dyn UserBackend, mailbox: Mailbox) -> io::Result<AddrOutcome> {
    if !backend.local_domain(&mailbox.domain)? {
        return Ok(AddrOutcome::NotLocal { mailbox });
    }
    let (exists, uc) = backend.probe(&mailbox.local, &mailbox.domain)?;
    if exists.accepts() {
        Ok(AddrOutcome::Accepted {
            mailbox: Some(mailbox),
            exists,
            uc,
        })
    } else {
        Ok(AddrOutcome::NoSuchUser { mailbox })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneDomain;

    impl UserBackend for OneDomain {
        fn local_domain(&self, domain: &str) -> io::Result<bool> {
            Ok(domain == "local.example")
        }

        fn probe(&self, local: &str, _domain: &str) -> io::Result<(UserExists, Userconf)> {
            let exists = match local {
                "alice" => UserExists::Deliverable,
                "list" => UserExists::MailingList,
                _ => UserExists::NoSuchUser,
            };
            Ok((exists, Userconf::empty()))
        }
    }

    fn mbox(local: &str, domain: &str) -> Mailbox {
        Mailbox {
            local: local.into(),
            domain: domain.into(),
        }
    }

    #[test]
    fn routes_local_remote_and_missing() {
        match resolve(&OneDomain, mbox("alice", "local.example")).unwrap() {
            AddrOutcome::Accepted { exists, .. } => assert_eq!(exists, UserExists::Deliverable),
            _ => panic!("expected accept"),
        }
        match resolve(&OneDomain, mbox("bob", "remote.example")).unwrap() {
            AddrOutcome::NotLocal { mailbox } => assert_eq!(mailbox.domain, "remote.example"),
            _ => panic!("expected not-local"),
        }
        match resolve(&OneDomain, mbox("nobody", "local.example")).unwrap() {
            AddrOutcome::NoSuchUser { mailbox } => assert_eq!(mailbox.local, "nobody"),
            _ => panic!("expected no-such-user"),
        }
    }
}
