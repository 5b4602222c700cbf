use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use structopt::StructOpt;
use tracing::{error, warn};

use smtp_wire::NetError;
use smtpd::{
    config::{self, AuthConfig, Config, DEFAULT_QMAIL_DIR},
    queue::ChildQueue,
    session::{self, Deps},
    tls, vpop,
    xmit::Transmission,
    DynAsyncReadWrite,
};

#[derive(StructOpt)]
#[structopt(
    name = "postern-smtpd",
    about = "Policy-checking inbound SMTP front end for a qmail-style queue"
)]
struct Opt {
    /// Hostname announced for AUTH
    auth_realm: Option<String>,

    /// checkpassword-style helper; AUTH is only offered when this is given
    #[structopt(parse(from_os_str))]
    checkpassword: Option<PathBuf>,

    /// Subprogram (and arguments) the helper invokes on success
    subprogram: Vec<String>,
}

fn auth_from_args(opt: &Opt) -> Option<AuthConfig> {
    let realm = opt.auth_realm.as_ref()?;
    let checkpassword = opt.checkpassword.as_ref()?;
    if opt.subprogram.is_empty() {
        warn!("invalid number of parameters given, AUTH disabled");
        return None;
    }
    if !smtp_wire::domain_valid(realm) {
        warn!("domainname for auth invalid: {}", realm);
        return None;
    }
    if !checkpassword.exists() {
        warn!(
            "checkpassword program '{}' does not exist",
            checkpassword.display()
        );
        return None;
    }
    Some(AuthConfig {
        realm: realm.clone(),
        checkpassword: checkpassword.clone(),
        subprogram: opt.subprogram.clone(),
    })
}

/// Enough configuration to hold a degraded session that only answers
/// NOOP, RSET and QUIT.
fn fallback_config(qmail_dir: PathBuf) -> Config {
    Config {
        qmail_dir,
        helo_name: "unknown".to_owned(),
        rcpthosts: Vec::new(),
        timeout: Duration::from_secs(config::DEFAULT_TIMEOUT_SECS),
        databytes: 0,
        force_ssl_auth: false,
        global_conf: None,
        vpopbounce: None,
        auth: None,
        tarpit: Duration::from_secs(1),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
    // broken pipes must surface as write errors, not kill the session
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let opt = Opt::from_args();
    let qmail_dir = PathBuf::from(
        std::env::var("AUTOQMAIL").unwrap_or_else(|_| DEFAULT_QMAIL_DIR.to_owned()),
    );
    let auth = auth_from_args(&opt);

    let mut broken = false;
    if let Err(e) = std::env::set_current_dir(&qmail_dir) {
        error!("cannot chdir to qmail directory: {}", e);
        broken = true;
    }
    let cfg = if broken {
        fallback_config(qmail_dir)
    } else {
        match config::load(qmail_dir.clone(), auth) {
            Ok(c) => c,
            Err(e) => {
                error!("setup failed: {:#}", e);
                broken = true;
                fallback_config(qmail_dir)
            }
        }
    };

    let xmit = Transmission::from_env();
    let send_banner = std::env::var("BANNER").is_err();

    smol::block_on(async move {
        let dns: Arc<dyn smtp_dns::Dns> = Arc::new(
            smtp_dns::SystemDns::from_system_conf()
                .await
                .context("configuring the resolver from the system configuration")?,
        );
        let tls = match tls::load_server_tls(&cfg.control_dir()) {
            Ok(t) => t,
            Err(e) => {
                warn!("STARTTLS disabled: {:#}", e);
                None
            }
        };
        let cfg = Arc::new(cfg);
        let deps = Arc::new(Deps {
            cfg: cfg.clone(),
            dns,
            backend: Arc::new(vpop::VpopBackend::new(cfg.clone())),
            queue: Arc::new(ChildQueue::new(cfg.qmail_dir.join("bin/qmail-queue"))),
            tls,
        });

        let io: DynAsyncReadWrite = duplexify::Duplex::new(
            Box::pin(smol::Unblock::new(std::io::stdin())),
            Box::pin(smol::Unblock::new(std::io::stdout())),
        );
        match session::interact(io, deps, xmit, send_banner, broken).await {
            Ok(()) => {}
            Err(NetError::TimedOut) => error!("connection timed out"),
            // a peer reset dies silently
            Err(NetError::Closed) => {}
            Err(e) => error!("session ended abnormally: {}", e),
        }
        Ok(())
    })
}
