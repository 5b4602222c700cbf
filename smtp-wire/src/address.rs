use std::fmt;

/// One envelope mailbox, already syntax-checked.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mailbox {
    pub local: String,
    pub domain: String,
}

impl Mailbox {
    pub fn address(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// A parsed forward or reverse path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Path {
    /// Empty reverse path, `<>`; valid only for MAIL FROM.
    Bounce,
    /// Bare `postmaster` without a domain; valid only for RCPT TO.
    Postmaster,
    Mailbox(Mailbox),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AddrError {
    #[error("mail address syntactically incorrect")]
    Syntax,
}

/// Check a name against the classic strict domain rule: letters, digits,
/// dots and hyphens only; no leading, trailing or doubled dot; at least
/// one dot; total length 5..=255; and the top label must end in a letter.
/// Single-label names are therefore rejected, on purpose.
pub fn domain_valid(host: &str) -> bool {
    let b = host.as_bytes();
    if b.len() < 5 || b.len() > 255 || b[0] == b'.' {
        return false;
    }
    let mut dot = false;
    let mut prev = 0u8;
    for &c in b {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => {}
            b'.' => {
                if prev == b'.' {
                    return false;
                }
                dot = true;
            }
            _ => return false,
        }
        prev = c;
    }
    dot && b[b.len() - 1].is_ascii_alphabetic()
}

fn localpart_valid(local: &str) -> bool {
    let b = local.as_bytes();
    if b.is_empty() || b.len() > 256 || b[0] == b'.' || b[b.len() - 1] == b'.' {
        return false;
    }
    let mut prev = 0u8;
    for &c in b {
        match c {
            b'a'..=b'z'
            | b'A'..=b'Z'
            | b'0'..=b'9'
            | b'!'
            | b'#'
            | b'$'
            | b'%'
            | b'&'
            | b'\''
            | b'*'
            | b'+'
            | b'-'
            | b'/'
            | b'='
            | b'?'
            | b'^'
            | b'_'
            | b'`'
            | b'{'
            | b'|'
            | b'}'
            | b'~' => {}
            b'.' => {
                if prev == b'.' {
                    return false;
                }
            }
            _ => return false,
        }
        prev = c;
    }
    true
}

/// Parse the `<path>` argument of MAIL FROM or RCPT TO.
///
/// `input` is everything after the colon of the verb; an optional single
/// leading space is tolerated. Returns the parsed path and the remaining
/// bytes after the closing `>`, which carry any ESMTP parameters.
///
/// The RFC 2821 source-route form `<@a,@b:user@host>` is accepted and the
/// route is discarded; an empty path is only a bounce for `is_rcpt ==
/// false`; a bare `postmaster` is only accepted for `is_rcpt == true`.
pub fn parse_path(input: &str, is_rcpt: bool) -> Result<(Path, &str), AddrError> {
    let input = input.strip_prefix(' ').unwrap_or(input);
    let input = input.strip_prefix('<').ok_or(AddrError::Syntax)?;
    let close = input.find('>').ok_or(AddrError::Syntax)?;
    let (inner, rest) = (&input[..close], &input[close + 1..]);

    if inner.is_empty() {
        if is_rcpt {
            return Err(AddrError::Syntax);
        }
        return Ok((Path::Bounce, rest));
    }

    // strip a source route: @one,@two:mailbox
    let mut addr = inner;
    if addr.starts_with('@') {
        let colon = addr.find(':').ok_or(AddrError::Syntax)?;
        for hop in addr[..colon].split(',') {
            let host = hop.strip_prefix('@').ok_or(AddrError::Syntax)?;
            if !domain_valid(host) {
                return Err(AddrError::Syntax);
            }
        }
        addr = &addr[colon + 1..];
    }

    match addr.rfind('@') {
        None => {
            if is_rcpt && addr.eq_ignore_ascii_case("postmaster") {
                Ok((Path::Postmaster, rest))
            } else {
                Err(AddrError::Syntax)
            }
        }
        Some(at) => {
            let (local, domain) = (&addr[..at], &addr[at + 1..]);
            if !localpart_valid(local) || !domain_valid(domain) {
                return Err(AddrError::Syntax);
            }
            Ok((
                Path::Mailbox(Mailbox {
                    local: local.to_owned(),
                    domain: domain.to_ascii_lowercase(),
                }),
                rest,
            ))
        }
    }
}
