//! Control-tree configuration.
//!
//! Everything lives under the qmail directory (`AUTOQMAIL`, default
//! `/var/qmail`): one-line files, integer files with defaults, and list
//! files with `#` comments. A session snapshots the tree once at startup.

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

pub const DEFAULT_QMAIL_DIR: &str = "/var/qmail";
pub const DEFAULT_TIMEOUT_SECS: u64 = 320;

/// AUTH via a checkpassword-style helper, configured on the command line.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub realm: String,
    pub checkpassword: PathBuf,
    pub subprogram: Vec<String>,
}

pub struct Config {
    pub qmail_dir: PathBuf,
    /// control/me: the name we present in banners and Received lines.
    pub helo_name: String,
    /// control/rcpthosts: domains we accept mail for.
    pub rcpthosts: Vec<String>,
    pub timeout: Duration,
    /// control/databytes: maximum message size, 0 means unlimited.
    pub databytes: u64,
    /// control/forcesslauth: only advertise AUTH after STARTTLS.
    pub force_ssl_auth: bool,
    /// control/filterconf: global policy settings.
    pub global_conf: Option<Vec<String>>,
    /// control/vpopbounce: the bounce command marking a dead catch-all.
    pub vpopbounce: Option<String>,
    pub auth: Option<AuthConfig>,
    /// Delay inserted before every rejection.
    pub tarpit: Duration,
}

impl Config {
    pub fn control_dir(&self) -> PathBuf {
        self.qmail_dir.join("control")
    }

    pub fn control_path(&self, name: &str) -> PathBuf {
        self.control_dir().join(name)
    }

    pub fn users_cdb(&self) -> PathBuf {
        self.qmail_dir.join("users/cdb")
    }
}

/// Read a single-line file; `None` when it does not exist.
pub fn load_oneliner(path: &Path) -> io::Result<Option<String>> {
    match fs::File::open(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
        Ok(mut f) => {
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            let line = buf.lines().next().unwrap_or("").trim().to_owned();
            Ok(Some(line))
        }
    }
}

/// Read an integer file with a default for absence.
pub fn load_int(path: &Path, default: u64) -> io::Result<u64> {
    match load_oneliner(path)? {
        None => Ok(default),
        Some(line) if line.is_empty() => Ok(default),
        Some(line) => line
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "not a number")),
    }
}

/// Read a list file: one entry per line, `#` comments and blank lines
/// stripped. `None` when the file does not exist.
pub fn load_list(path: &Path) -> io::Result<Option<Vec<String>>> {
    match fs::File::open(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
        Ok(mut f) => {
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            Ok(Some(parse_list(&buf)))
        }
    }
}

pub fn parse_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_owned())
        .collect()
}

pub fn load(qmail_dir: PathBuf, auth: Option<AuthConfig>) -> anyhow::Result<Config> {
    let control = qmail_dir.join("control");

    let helo_name = load_oneliner(&control.join("me"))
        .context("reading control/me")?
        .filter(|l| !l.is_empty())
        .context("control/me missing or empty")?;
    anyhow::ensure!(
        smtp_wire::domain_valid(&helo_name),
        "control/me contains invalid name"
    );

    let rcpthosts = load_list(&control.join("rcpthosts"))
        .context("reading control/rcpthosts")?
        .context("control/rcpthosts not found")?;
    anyhow::ensure!(
        !rcpthosts.is_empty(),
        "found no valid names in control/rcpthosts"
    );

    let timeout = load_int(&control.join("timeoutsmtpd"), DEFAULT_TIMEOUT_SECS)
        .context("parse error in control/timeoutsmtpd")?;
    let databytes =
        load_int(&control.join("databytes"), 0).context("parse error in control/databytes")?;
    let force_ssl_auth = load_int(&control.join("forcesslauth"), 0)
        .context("parse error in control/forcesslauth")?
        != 0;

    let global_conf = load_list(&control.join("filterconf")).context("reading control/filterconf")?;
    let vpopbounce = load_oneliner(&control.join("vpopbounce")).context("reading control/vpopbounce")?;

    Ok(Config {
        qmail_dir,
        helo_name,
        rcpthosts,
        timeout: Duration::from_secs(timeout),
        databytes,
        force_ssl_auth,
        global_conf,
        vpopbounce,
        auth,
        tarpit: Duration::from_secs(1),
    })
}
