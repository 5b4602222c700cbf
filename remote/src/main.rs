use std::{
    io::{Read, Write},
    net::Ipv6Addr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use structopt::StructOpt;
use tracing::warn;

use remote::{
    conn::{get_route, try_connect},
    session::{Extensions, MailParams, Remote},
    status, DynAsyncReadWrite, TransportError,
};
use smtp_dns::{Dns, SystemDns};

const DEFAULT_QMAIL_DIR: &str = "/var/qmail";
const DEFAULT_TIMEOUT_SECS: u64 = 320;
const DEFAULT_CHUNK_SIZE: u64 = 32768;

#[derive(StructOpt)]
#[structopt(
    name = "postern-remote",
    about = "Outbound SMTP transmission for a qmail-style queue"
)]
struct Opt {
    /// Target domain, or an address literal in brackets
    host: String,

    /// Envelope sender (empty for bounces)
    sender: String,

    /// Envelope recipients
    rcpts: Vec<String>,
}

struct Setup {
    helo: String,
    timeout: Duration,
    chunk_size: usize,
    outgoing_ip: Option<Ipv6Addr>,
    control: PathBuf,
}

fn oneliner(path: &PathBuf) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_owned()))
        .filter(|l| !l.is_empty())
}

fn setup() -> Result<Setup, TransportError> {
    let qmail_dir = PathBuf::from(
        std::env::var("AUTOQMAIL").unwrap_or_else(|_| DEFAULT_QMAIL_DIR.to_owned()),
    );
    let control = qmail_dir.join("control");

    let helo = oneliner(&control.join("helohost"))
        .or_else(|| oneliner(&control.join("me")))
        .ok_or(TransportError::Config)?;
    if !smtp_wire::domain_valid(&helo) {
        return Err(TransportError::Config);
    }

    let timeout = match oneliner(&control.join("timeoutremote")) {
        None => DEFAULT_TIMEOUT_SECS,
        Some(l) => l.parse().map_err(|_| TransportError::Config)?,
    };
    let chunk_size = match oneliner(&control.join("chunksizeremote")) {
        None => DEFAULT_CHUNK_SIZE,
        Some(l) => l.parse().map_err(|_| TransportError::Config)?,
    };
    if chunk_size >= (1 << 31) {
        return Err(TransportError::Config);
    }
    let outgoing_ip = match oneliner(&control.join("outgoingip")) {
        None => None,
        Some(l) => Some(
            l.parse::<Ipv6Addr>()
                .or_else(|_| l.parse::<std::net::Ipv4Addr>().map(smtp_dns::map_v4))
                .map_err(|_| TransportError::Config)?,
        ),
    };

    Ok(Setup {
        helo,
        timeout: Duration::from_secs(timeout),
        chunk_size: chunk_size as usize,
        outgoing_ip,
        control,
    })
}

struct NoCertVerifier;

impl rustls::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<rustls::ServerCertVerified, rustls::TLSError> {
        // opportunistic STARTTLS: any certificate beats cleartext
        Ok(rustls::ServerCertVerified::assertion())
    }
}

fn tls_connector() -> async_tls::TlsConnector {
    let mut cfg = rustls::ClientConfig::new();
    cfg.dangerous()
        .set_certificate_verifier(Arc::new(NoCertVerifier));
    async_tls::TlsConnector::from(Arc::new(cfg))
}

async fn run(opt: Opt, setup: Setup, message: Vec<u8>) -> Result<(), TransportError> {
    let dns = SystemDns::from_system_conf()
        .await
        .map_err(|_| TransportError::Config)?;

    let mut route = get_route(&dns, &opt.host, &setup.control).await?;
    route.list.sort();

    // try candidates until one answers with a usable greeting
    let mut remote = loop {
        let stream = try_connect(
            &mut route.list,
            setup.outgoing_ip,
            route.port,
            setup.timeout,
        )
        .await?;
        let (r, w) = futures::io::AsyncReadExt::split(stream);
        let io: DynAsyncReadWrite = duplexify::Duplex::new(Box::pin(r), Box::pin(w));
        match Remote::handshake(io, setup.timeout, &setup.helo).await {
            Ok(r) => break r,
            Err(e) => {
                warn!("greeting failed: {}", e);
                continue;
            }
        }
    };

    // identify the peer for logs and status lines
    let (active_addr, active_name) = match route.list.active() {
        Some(c) => (c.addr, c.name.clone()),
        None => return Err(TransportError::NoConnection),
    };
    let partner_fqdn = match dns.ptr(&active_addr).await {
        Ok(name) => Some(name),
        Err(_) => None,
    };
    let shown_ip = smtp_dns::unmap(&active_addr);
    let rhost = match &partner_fqdn {
        Some(name) => format!("{} [{}]", name, shown_ip),
        None => format!("[{}]", shown_ip),
    };

    if remote.ext.contains(Extensions::STARTTLS) {
        // the TLS library wants a name; fall back to whatever we know
        let sni = partner_fqdn
            .clone()
            .or(active_name)
            .unwrap_or_else(|| opt.host.clone());
        if smtp_wire::domain_valid(&sni) {
            remote.starttls(&tls_connector(), &sni, &setup.helo).await?;
        }
    }

    let params = MailParams {
        sender: &opt.sender,
        rcpts: &opt.rcpts,
        message: &message,
        chunk_size: setup.chunk_size,
    };
    let mut stdout = std::io::stdout();
    remote.send_mail(&params, &rhost, &mut stdout).await?;
    stdout.flush().map_err(|e| TransportError::Net(e.to_string()))?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let opt = Opt::from_args();
    let mut stdout = std::io::stdout();
    if opt.rcpts.is_empty() {
        let _ = status::write_fatal(
            &mut stdout,
            "Zinternal error: invoked with invalid arguments",
        );
        return;
    }

    let setup = match setup() {
        Ok(s) => s,
        Err(e) => {
            let _ = status::write_fatal(&mut stdout, &e.to_string());
            return;
        }
    };

    // the spool arrives on fd 0
    let mut message = Vec::new();
    if std::io::stdin().read_to_end(&mut message).is_err() {
        let _ = status::write_fatal(&mut stdout, "Zinternal error: cannot read message");
        return;
    }

    if let Err(e) = smol::block_on(run(opt, setup, message)) {
        let _ = status::write_fatal(&mut stdout, &e.to_string());
    }
}
