//! vpopmail-style user store backend.
//!
//! Domain directories come out of the `users/cdb` database keyed
//! `!<domain>-`; inside a domain directory, delivery is decided by the
//! user directory and the `.qmail-*` files. The `.`→`:` rewrite of
//! localparts in `.qmail` file names is mailbox-store policy and stays
//! confined to this module.

use std::{
    io::{self, Read},
    path::PathBuf,
    sync::Arc,
};

use openat::Dir;

use crate::{
    addrparse::{UserBackend, UserExists},
    cdb,
    config::Config,
    userconf::Userconf,
};

/// Look up the domain directory in `users/cdb`. The record format is
/// `realdomain\0uid\0gid\0path\0`; trailing slashes on the path are
/// stripped.
pub fn vget_dir(cfg: &Config, domain: &str) -> io::Result<Option<PathBuf>> {
    let mut key = Vec::with_capacity(domain.len() + 2);
    key.push(b'!');
    key.extend_from_slice(domain.to_ascii_lowercase().as_bytes());
    key.push(b'-');

    let data = match cdb::lookup(&cfg.users_cdb(), &key)? {
        None => return Ok(None),
        Some(d) => d,
    };
    let mut fields = data.split(|&b| b == 0);
    let _realdomain = fields.next();
    let _uid = fields.next();
    let _gid = fields.next();
    let path = match fields.next() {
        None | Some(&[]) => return Ok(None),
        Some(p) => p,
    };
    let path = String::from_utf8_lossy(path);
    Ok(Some(PathBuf::from(path.trim_end_matches('/'))))
}

enum QmFile {
    Absent,
    /// The file exists; the handle is `None` when it was unreadable
    /// (EACCES), which still counts as existing.
    Exists(Option<std::fs::File>),
}

/// Check for a `.qmail-` file. `suffix` is appended with `.` rewritten
/// to `:`; `default` appends `default` (with a separating dash when both
/// are present).
fn qmexists(dir: &Dir, suffix: Option<&str>, default: bool) -> io::Result<QmFile> {
    let mut name = String::from(".qmail-");
    if let Some(s) = suffix {
        name.push_str(&s.replace('.', ":"));
        if default {
            name.push('-');
        }
    }
    if default {
        name.push_str("default");
    }
    match dir.open_file(&name) {
        Ok(f) => Ok(QmFile::Exists(Some(f))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(QmFile::Absent),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(QmFile::Exists(None)),
        Err(e) if e.raw_os_error() == Some(libc::EISDIR) => Ok(QmFile::Absent),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(QmFile::Absent),
        Err(e) => Err(e),
    }
}

fn open_dir(path: &std::path::Path) -> io::Result<Option<Dir>> {
    match Dir::open(path) {
        Ok(d) => Ok(Some(d)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(None),
        Err(e) => Err(e),
    }
}

fn sub_dir(dir: &Dir, name: &str) -> io::Result<Option<Dir>> {
    match dir.sub_dir(name) {
        Ok(d) => Ok(Some(d)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The five-way existence decision for one localpart under an already
/// opened domain directory.
pub fn user_exists(
    domain_dir: &Dir,
    local: &str,
    vpopbounce: Option<&str>,
) -> io::Result<(UserExists, Option<Dir>)> {
    // '/' is legal in a localpart but would walk the filesystem
    if local.contains('/') {
        return Ok((UserExists::NoSuchUser, None));
    }

    match sub_dir(domain_dir, local) {
        Ok(Some(user_dir)) => return Ok((UserExists::Deliverable, Some(user_dir))),
        Ok(None) => {}
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            // exists but unreadable: assume deliverable
            return Ok((UserExists::Deliverable, None));
        }
        Err(e) => return Err(e),
    }

    match qmexists(domain_dir, Some(local), false)? {
        QmFile::Exists(_) => return Ok((UserExists::MailingList, None)),
        QmFile::Absent => {}
    }
    match qmexists(domain_dir, Some(local), true)? {
        QmFile::Exists(_) => return Ok((UserExists::MailingList, None)),
        QmFile::Absent => {}
    }

    // a dash-separated localpart may be caught by .qmail-<prefix>-default
    let mut dash = local.find('-');
    while let Some(p) = dash {
        match qmexists(domain_dir, Some(&local[..p]), true)? {
            QmFile::Exists(_) => return Ok((UserExists::PrefixDefault, None)),
            QmFile::Absent => {}
        }
        dash = local[p + 1..].find('-').map(|q| p + 1 + q);
    }

    match qmexists(domain_dir, None, true)? {
        QmFile::Absent => Ok((UserExists::NoSuchUser, None)),
        QmFile::Exists(None) => Ok((UserExists::CatchAll, None)),
        QmFile::Exists(Some(mut f)) => {
            let bounce = match vpopbounce {
                // without a configured bounce command we cannot tell, so
                // accept the mail
                None => return Ok((UserExists::CatchAll, None)),
                Some(b) => b,
            };
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            if buf.trim_end() == bounce.trim_end() {
                Ok((UserExists::NoSuchUser, None))
            } else {
                Ok((UserExists::CatchAll, None))
            }
        }
    }
}

/// The production [`UserBackend`].
pub struct VpopBackend {
    cfg: Arc<Config>,
}

impl VpopBackend {
    pub fn new(cfg: Arc<Config>) -> VpopBackend {
        VpopBackend { cfg }
    }
}

impl UserBackend for VpopBackend {
    fn local_domain(&self, domain: &str) -> io::Result<bool> {
        let domain = domain.to_ascii_lowercase();
        if self
            .cfg
            .rcpthosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&domain))
        {
            return Ok(true);
        }
        let more = self.cfg.control_path("morercpthosts.cdb");
        Ok(cdb::lookup(&more, domain.as_bytes())?.is_some())
    }

    fn probe(&self, local: &str, domain: &str) -> io::Result<(UserExists, Userconf)> {
        let mut uc = Userconf::empty();

        let path = match vget_dir(&self.cfg, domain)? {
            None => return Ok((UserExists::NotVpop, uc)),
            Some(p) => p,
        };

        let dir = match open_dir(&path) {
            Ok(Some(d)) => d,
            // directory vanished since the cdb was built
            Ok(None) => return Ok((UserExists::NoSuchUser, uc)),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                // it exists, we just may not look; assume the user does too
                uc.domain_path = Some(path);
                return Ok((UserExists::Deliverable, uc));
            }
            Err(e) => return Err(e),
        };

        let (exists, user_dir) = user_exists(&dir, local, self.cfg.vpopbounce.as_deref())?;
        uc.domain_path = Some(path);
        uc.domain_dir = Some(dir);
        uc.user_dir = user_dir;
        Ok((exists, uc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, path::Path};
    use tempdir::TempDir;

    const BOUNCE: &str = "|/home/vpopmail/bin/vdelivermail '' bounce-no-mailbox";

    fn domain_fixture(tmp: &TempDir) -> PathBuf {
        let d = tmp.path().join("vpop/example.org");
        fs::create_dir_all(&d).unwrap();
        d
    }

    fn probe(dir: &Path, local: &str, bounce: Option<&str>) -> UserExists {
        let dir = Dir::open(dir).unwrap();
        user_exists(&dir, local, bounce).unwrap().0
    }

    #[test]
    fn user_directory_wins() {
        let tmp = TempDir::new("vpop").unwrap();
        let d = domain_fixture(&tmp);
        fs::create_dir(d.join("alice")).unwrap();
        assert_eq!(probe(&d, "alice", Some(BOUNCE)), UserExists::Deliverable);
    }

    #[test]
    fn dotqmail_with_colon_rewrite_is_a_list() {
        let tmp = TempDir::new("vpop").unwrap();
        let d = domain_fixture(&tmp);
        fs::write(d.join(".qmail-jane:doe"), "list\n").unwrap();
        assert_eq!(probe(&d, "jane.doe", Some(BOUNCE)), UserExists::MailingList);

        fs::write(d.join(".qmail-announce-default"), "list\n").unwrap();
        assert_eq!(probe(&d, "announce", Some(BOUNCE)), UserExists::MailingList);
    }

    #[test]
    fn dash_prefix_default_is_found() {
        let tmp = TempDir::new("vpop").unwrap();
        let d = domain_fixture(&tmp);
        fs::write(d.join(".qmail-owner-default"), "x\n").unwrap();
        assert_eq!(
            probe(&d, "owner-list-bounces", Some(BOUNCE)),
            UserExists::PrefixDefault
        );
    }

    #[test]
    fn qmail_default_vs_vpopbounce() {
        let tmp = TempDir::new("vpop").unwrap();
        let d = domain_fixture(&tmp);

        // no .qmail-default at all
        assert_eq!(probe(&d, "ghost", Some(BOUNCE)), UserExists::NoSuchUser);

        // .qmail-default that is exactly the bounce command
        fs::write(d.join(".qmail-default"), format!("{}\n", BOUNCE)).unwrap();
        assert_eq!(probe(&d, "ghost", Some(BOUNCE)), UserExists::NoSuchUser);

        // .qmail-default that actually delivers somewhere
        fs::write(d.join(".qmail-default"), "./Maildir/\n").unwrap();
        assert_eq!(probe(&d, "ghost", Some(BOUNCE)), UserExists::CatchAll);

        // without a configured bounce command we cannot tell
        assert_eq!(probe(&d, "ghost", None), UserExists::CatchAll);
    }

    #[test]
    fn slash_in_localpart_never_matches() {
        let tmp = TempDir::new("vpop").unwrap();
        let d = domain_fixture(&tmp);
        fs::write(d.join(".qmail-default"), "./Maildir/\n").unwrap();
        assert_eq!(probe(&d, "../../etc/passwd", Some(BOUNCE)), UserExists::NoSuchUser);
    }

    fn full_backend(tmp: &TempDir) -> VpopBackend {
        let control = tmp.path().join("control");
        fs::create_dir_all(&control).unwrap();
        let domaindir = tmp.path().join("vpop/example.org");
        fs::create_dir_all(&domaindir).unwrap();
        fs::create_dir_all(tmp.path().join("users")).unwrap();
        crate::cdb::testutil::build(
            &tmp.path().join("users/cdb"),
            &[(
                b"!example.org-",
                format!("example.org\x0089\x0089\x00{}\x00", domaindir.display()).as_bytes(),
            )],
        );
        let cfg = Config {
            qmail_dir: tmp.path().to_owned(),
            helo_name: "mx.example.org".into(),
            rcpthosts: vec!["example.org".into()],
            timeout: std::time::Duration::from_secs(10),
            databytes: 0,
            force_ssl_auth: false,
            global_conf: None,
            vpopbounce: Some(BOUNCE.into()),
            auth: None,
            tarpit: std::time::Duration::from_secs(0),
        };
        VpopBackend::new(Arc::new(cfg))
    }

    #[test]
    fn backend_routes_through_cdb() {
        let tmp = TempDir::new("vpop").unwrap();
        let backend = full_backend(&tmp);
        fs::create_dir(tmp.path().join("vpop/example.org/alice")).unwrap();

        assert!(backend.local_domain("example.org").unwrap());
        assert!(backend.local_domain("EXAMPLE.ORG").unwrap());
        assert!(!backend.local_domain("elsewhere.example").unwrap());

        let (exists, uc) = backend.probe("alice", "example.org").unwrap();
        assert_eq!(exists, UserExists::Deliverable);
        assert!(uc.domain_dir.is_some());
        assert!(uc.user_dir.is_some());

        let (exists, _) = backend.probe("nobody", "example.org").unwrap();
        assert_eq!(exists, UserExists::NoSuchUser);
    }

    #[test]
    fn unknown_cdb_domain_is_not_vpop() {
        let tmp = TempDir::new("vpop").unwrap();
        let backend = full_backend(&tmp);
        let (exists, _) = backend.probe("whoever", "other.example").unwrap();
        assert_eq!(exists, UserExists::NotVpop);
    }
}
