//! Per-recipient configuration resolution.
//!
//! Policy keys can live in three scopes: the recipient's user directory,
//! the recipient's domain directory, and the global `control/` tree. The
//! directory handles are cached in [`Userconf`] for the duration of one
//! `RCPT TO`, so the policy callbacks reference files by handle rather
//! than by path.

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use openat::Dir;

use crate::config::parse_list;

pub const INHERIT: &str = "!inherit";

/// Which scope a key was found in; `as_str` is the name used in log
/// messages ("user policy", "domain policy", ...).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    User,
    Domain,
    Global,
    None,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Domain => "domain",
            Scope::Global => "global",
            Scope::None => "none",
        }
    }

    fn wider(self) -> Scope {
        match self {
            Scope::User => Scope::Domain,
            Scope::Domain => Scope::Global,
            _ => Scope::None,
        }
    }
}

/// Left-anchored subdomain match: `example.com` matches itself and any
/// subdomain, `.example.com` matches only proper subdomains.
pub fn domain_matches(entry: &str, domain: &str) -> bool {
    let entry = entry.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    if let Some(stripped) = entry.strip_prefix('.') {
        domain.len() > stripped.len() && domain.ends_with(&entry)
    } else {
        domain == entry || domain.ends_with(&format!(".{}", entry))
    }
}

#[derive(Default)]
pub struct Userconf {
    pub domain_path: Option<PathBuf>,
    pub domain_dir: Option<Dir>,
    pub user_dir: Option<Dir>,
    /// filterconf at user scope, loaded once per RCPT.
    pub user_conf: Option<Vec<String>>,
    /// filterconf at domain scope.
    pub domain_conf: Option<Vec<String>>,
}

fn open_in(dir: &Dir, key: &str) -> io::Result<Option<fs::File>> {
    match dir.open_file(key) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::EISDIR) => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_lines(mut f: fs::File) -> io::Result<Vec<String>> {
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    Ok(parse_list(&buf))
}

impl Userconf {
    pub fn empty() -> Userconf {
        Userconf::default()
    }

    /// Load the `filterconf` lists for both scopes, tolerating absence.
    pub fn load_filterconf(&mut self) -> io::Result<()> {
        if let Some(dir) = &self.user_dir {
            if let Some(f) = open_in(dir, "filterconf")? {
                self.user_conf = Some(read_lines(f)?);
            }
        }
        if let Some(dir) = &self.domain_dir {
            if let Some(f) = open_in(dir, "filterconf")? {
                self.domain_conf = Some(read_lines(f)?);
            }
        }
        Ok(())
    }

    /// Open the first existing `key` file, narrowest scope first.
    /// `global` is the control directory; pass `None` to restrict the
    /// search to user and domain scope.
    pub fn get_file(
        &self,
        global: Option<&Path>,
        key: &str,
    ) -> io::Result<Option<(fs::File, Scope)>> {
        self.get_file_from(Scope::User, global, key)
    }

    fn get_file_from(
        &self,
        start: Scope,
        global: Option<&Path>,
        key: &str,
    ) -> io::Result<Option<(fs::File, Scope)>> {
        if start == Scope::User {
            if let Some(dir) = &self.user_dir {
                if let Some(f) = open_in(dir, key)? {
                    return Ok(Some((f, Scope::User)));
                }
            }
        }
        if start == Scope::User || start == Scope::Domain {
            if let Some(dir) = &self.domain_dir {
                if let Some(f) = open_in(dir, key)? {
                    return Ok(Some((f, Scope::Domain)));
                }
            }
        }
        if let Some(control) = global {
            match fs::File::open(control.join(key)) {
                Ok(f) => return Ok(Some((f, Scope::Global))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Load `key` as a list; a `!inherit` line splices the next wider
    /// scope's list in at that position.
    pub fn get_list(
        &self,
        global: Option<&Path>,
        key: &str,
        inherit: bool,
    ) -> io::Result<Option<(Vec<String>, Scope)>> {
        self.get_list_from(Scope::User, global, key, inherit)
    }

    fn get_list_from(
        &self,
        start: Scope,
        global: Option<&Path>,
        key: &str,
        inherit: bool,
    ) -> io::Result<Option<(Vec<String>, Scope)>> {
        let (f, scope) = match self.get_file_from(start, global, key)? {
            None => return Ok(None),
            Some(hit) => hit,
        };
        let mut values = read_lines(f)?;
        if inherit && scope != Scope::Global {
            if let Some(at) = values.iter().position(|l| l == INHERIT) {
                let wider = self
                    .get_list_from(scope.wider(), global, key, inherit)?
                    .map(|(v, _)| v)
                    .unwrap_or_default();
                values.splice(at..=at, wider);
            }
        }
        Ok(Some((values, scope)))
    }

    /// Test whether any entry of the `key` list matches `domain`.
    pub fn find_domain(&self, global: Option<&Path>, key: &str, domain: &str) -> io::Result<Scope> {
        match self.get_list(global, key, false)? {
            None => Ok(Scope::None),
            Some((entries, scope)) => {
                if entries.iter().any(|e| domain_matches(e, domain)) {
                    Ok(scope)
                } else {
                    Ok(Scope::None)
                }
            }
        }
    }

    fn setting_in(lines: &[String], key: &str) -> Option<i64> {
        for l in lines {
            if l == key {
                return Some(1);
            }
            if let Some(v) = l.strip_prefix(key) {
                if let Some(v) = v.strip_prefix('=') {
                    return v.trim().parse().ok().or(Some(0));
                }
            }
        }
        None
    }

    /// Integer setting from the user or domain `filterconf`.
    pub fn get_setting(&self, key: &str) -> (i64, Scope) {
        if let Some(lines) = &self.user_conf {
            if let Some(v) = Self::setting_in(lines, key) {
                return (v, Scope::User);
            }
        }
        if let Some(lines) = &self.domain_conf {
            if let Some(v) = Self::setting_in(lines, key) {
                return (v, Scope::Domain);
            }
        }
        (0, Scope::None)
    }

    /// Integer setting, falling back to the global `control/filterconf`.
    pub fn get_setting_global(&self, global_conf: Option<&[String]>, key: &str) -> (i64, Scope) {
        let (v, scope) = self.get_setting(key);
        if scope != Scope::None {
            return (v, scope);
        }
        if let Some(lines) = global_conf {
            if let Some(v) = Self::setting_in(lines, key) {
                return (v, Scope::Global);
            }
        }
        (0, Scope::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempdir::TempDir;

    fn put(dir: &Path, name: &str, content: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn conf(tmp: &TempDir) -> (Userconf, PathBuf) {
        let user = tmp.path().join("domain/user");
        let domain = tmp.path().join("domain");
        let global = tmp.path().join("control");
        fs::create_dir_all(&user).unwrap();
        fs::create_dir_all(&global).unwrap();
        let uc = Userconf {
            domain_path: Some(domain.clone()),
            domain_dir: Some(Dir::open(&domain).unwrap()),
            user_dir: Some(Dir::open(&user).unwrap()),
            user_conf: None,
            domain_conf: None,
        };
        (uc, global)
    }

    #[test]
    fn narrowest_scope_wins() {
        let tmp = TempDir::new("userconf").unwrap();
        let (uc, global) = conf(&tmp);
        put(&tmp.path().join("domain"), "k", "domain-value\n");
        put(&global, "k", "global-value\n");
        let (values, scope) = uc.get_list(Some(&global), "k", false).unwrap().unwrap();
        assert_eq!(scope, Scope::Domain);
        assert_eq!(values, vec!["domain-value"]);

        put(&tmp.path().join("domain/user"), "k", "user-value\n");
        let (values, scope) = uc.get_list(Some(&global), "k", false).unwrap().unwrap();
        assert_eq!(scope, Scope::User);
        assert_eq!(values, vec!["user-value"]);
    }

    #[test]
    fn inherit_splices_in_place() {
        let tmp = TempDir::new("userconf").unwrap();
        let (uc, global) = conf(&tmp);
        put(&tmp.path().join("domain/user"), "k", "x\n!inherit\ny\n");
        put(&tmp.path().join("domain"), "k", "d1\nd2\n");
        let (values, scope) = uc.get_list(Some(&global), "k", true).unwrap().unwrap();
        assert_eq!(scope, Scope::User);
        assert_eq!(values, vec!["x", "d1", "d2", "y"]);
    }

    #[test]
    fn inherit_chases_to_global() {
        let tmp = TempDir::new("userconf").unwrap();
        let (uc, global) = conf(&tmp);
        put(&tmp.path().join("domain/user"), "k", "!inherit\n");
        put(&tmp.path().join("domain"), "k", "dom\n!inherit\n");
        put(&global, "k", "glob\n");
        let (values, _) = uc.get_list(Some(&global), "k", true).unwrap().unwrap();
        assert_eq!(values, vec!["dom", "glob"]);
    }

    #[test]
    fn inherit_with_nothing_wider_vanishes() {
        let tmp = TempDir::new("userconf").unwrap();
        let (uc, global) = conf(&tmp);
        put(&tmp.path().join("domain/user"), "k", "a\n!inherit\n");
        let (values, _) = uc.get_list(Some(&global), "k", true).unwrap().unwrap();
        assert_eq!(values, vec!["a"]);
    }

    #[test]
    fn find_domain_semantics() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("example.com", "foo.example.com"));
        assert!(domain_matches("Example.COM", "foo.example.com"));
        assert!(!domain_matches("example.com", "notexample.com"));
        assert!(domain_matches(".example.com", "foo.example.com"));
        assert!(!domain_matches(".example.com", "example.com"));

        let tmp = TempDir::new("userconf").unwrap();
        let (uc, global) = conf(&tmp);
        put(&tmp.path().join("domain"), "spfignore", "trusted.example\n");
        assert_eq!(
            uc.find_domain(Some(&global), "spfignore", "mx.trusted.example").unwrap(),
            Scope::Domain
        );
        assert_eq!(
            uc.find_domain(Some(&global), "spfignore", "other.example").unwrap(),
            Scope::None
        );
    }

    #[test]
    fn settings_with_scopes() {
        let uc = Userconf {
            user_conf: Some(vec!["fail_hard_on_temp".into(), "spfpolicy=3".into()]),
            domain_conf: Some(vec!["spfpolicy=1".into()]),
            ..Userconf::default()
        };
        assert_eq!(uc.get_setting("fail_hard_on_temp"), (1, Scope::User));
        assert_eq!(uc.get_setting("spfpolicy"), (3, Scope::User));
        assert_eq!(uc.get_setting("nonexist_on_block"), (0, Scope::None));

        let global = vec!["nonexist_on_block".to_owned()];
        assert_eq!(
            uc.get_setting_global(Some(&global), "nonexist_on_block"),
            (1, Scope::Global)
        );
    }
}
