//! SMTP AUTH against a checkpassword-style helper.
//!
//! The helper receives `user\0pass\0\0` on its fd 3 and signals success
//! with exit code 0. PLAIN and LOGIN are offered; the mechanisms both
//! end up in the same cleartext credential pair.

use std::{
    fs,
    io::{self, Write},
    os::unix::io::FromRawFd,
    os::unix::process::CommandExt,
    process,
};

use tracing::{info, warn};

use crate::{
    config::AuthConfig,
    session::{Flow, Session, SessionError},
};

/// Split the RFC 4616 PLAIN message `[authzid] \0 authcid \0 passwd`.
pub fn parse_plain(data: &[u8]) -> Option<(String, String)> {
    let mut parts = data.split(|&b| b == 0);
    let _authzid = parts.next()?;
    let user = parts.next()?;
    let pass = parts.next()?;
    if parts.next().is_some() || user.is_empty() {
        return None;
    }
    Some((
        String::from_utf8(user.to_vec()).ok()?,
        String::from_utf8(pass.to_vec()).ok()?,
    ))
}

pub async fn run_checkpassword(cfg: &AuthConfig, user: &str, pass: &str) -> io::Result<bool> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    unsafe {
        libc::fcntl(write_fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }

    // the payload fits the pipe buffer, so write-then-spawn is safe
    let mut payload = Vec::with_capacity(user.len() + pass.len() + 3);
    payload.extend_from_slice(user.as_bytes());
    payload.push(0);
    payload.extend_from_slice(pass.as_bytes());
    payload.push(0);
    payload.push(0);
    {
        let mut wf = unsafe { fs::File::from_raw_fd(write_fd) };
        wf.write_all(&payload)?;
    }

    let mut cmd = process::Command::new(&cfg.checkpassword);
    cmd.args(&cfg.subprogram)
        .stdin(process::Stdio::null())
        .stdout(process::Stdio::inherit())
        .stderr(process::Stdio::inherit());
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(read_fd, 3) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let spawned = cmd.spawn();
    unsafe {
        libc::close(read_fd);
    }
    let mut child = spawned?;
    let status = smol::unblock(move || child.wait()).await?;
    Ok(status.success())
}

enum AuthLine {
    Data(String),
    Cancelled,
}

impl Session {
    async fn read_auth_line(&mut self) -> Result<AuthLine, SessionError> {
        match self.io.read_line().await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(SessionError::Net(e)),
            Err(_) => return Err(SessionError::Syntax),
        }
        let line = String::from_utf8_lossy(self.io.line()).into_owned();
        if line == "*" {
            Ok(AuthLine::Cancelled)
        } else {
            Ok(AuthLine::Data(line))
        }
    }

    pub(crate) async fn smtp_auth(&mut self, arg: &str) -> Result<Flow, SessionError> {
        let auth_cfg = match &self.deps.cfg.auth {
            None => {
                self.reply("503 5.5.4 authentication not enabled").await?;
                return Err(SessionError::Done);
            }
            Some(a) => a.clone(),
        };
        if self.xmit.auth_name.is_some() {
            return Err(SessionError::BadSequence);
        }
        if self.deps.cfg.force_ssl_auth && !self.tls_active {
            self.reply("538 5.7.11 encryption required for requested authentication mechanism")
                .await?;
            return Err(SessionError::Done);
        }

        let mut parts = arg.splitn(2, ' ');
        let mech = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next().map(|s| s.to_owned());

        let creds = match mech.as_str() {
            "PLAIN" => {
                let b64 = match initial {
                    Some(s) => s,
                    None => {
                        self.reply("334 ").await?;
                        match self.read_auth_line().await? {
                            AuthLine::Cancelled => {
                                self.reply("501 5.0.0 authentication exchange cancelled").await?;
                                return Err(SessionError::Done);
                            }
                            AuthLine::Data(d) => d,
                        }
                    }
                };
                base64::decode(&b64).ok().and_then(|d| parse_plain(&d))
            }
            "LOGIN" => {
                let user_b64 = match initial {
                    Some(s) => s,
                    None => {
                        self.reply("334 VXNlcm5hbWU6").await?;
                        match self.read_auth_line().await? {
                            AuthLine::Cancelled => {
                                self.reply("501 5.0.0 authentication exchange cancelled").await?;
                                return Err(SessionError::Done);
                            }
                            AuthLine::Data(d) => d,
                        }
                    }
                };
                self.reply("334 UGFzc3dvcmQ6").await?;
                let pass_b64 = match self.read_auth_line().await? {
                    AuthLine::Cancelled => {
                        self.reply("501 5.0.0 authentication exchange cancelled").await?;
                        return Err(SessionError::Done);
                    }
                    AuthLine::Data(d) => d,
                };
                match (base64::decode(&user_b64), base64::decode(&pass_b64)) {
                    (Ok(u), Ok(p)) => match (String::from_utf8(u), String::from_utf8(p)) {
                        (Ok(u), Ok(p)) if !u.is_empty() => Some((u, p)),
                        _ => None,
                    },
                    _ => None,
                }
            }
            _ => {
                self.reply("504 5.5.4 Unrecognized authentication type").await?;
                return Err(SessionError::Done);
            }
        };

        let (user, pass) = match creds {
            None => {
                self.reply("501 5.5.2 base64 decoding error").await?;
                return Err(SessionError::Done);
            }
            Some(c) => c,
        };

        match run_checkpassword(&auth_cfg, &user, &pass).await {
            Ok(true) => {
                info!("authenticated user {}", user);
                self.xmit.auth_name = Some(user);
                self.reply("235 2.7.0 authentication successful").await?;
                Ok(Flow::Stay)
            }
            Ok(false) => {
                warn!("failed authentication for {}", user);
                self.tarpit().await;
                self.reply("535 5.7.8 authentication failed").await?;
                Err(SessionError::Done)
            }
            Err(e) => {
                warn!("cannot run checkpassword helper: {}", e);
                self.reply("454 4.7.0 temporary authentication failure").await?;
                Err(SessionError::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_parses() {
        assert_eq!(
            parse_plain(b"\0alice\0secret"),
            Some(("alice".into(), "secret".into()))
        );
        assert_eq!(
            parse_plain(b"admin\0alice\0secret"),
            Some(("alice".into(), "secret".into()))
        );
        assert!(parse_plain(b"no-nulls-here").is_none());
        assert!(parse_plain(b"\0\0pass").is_none(), "empty user");
        assert!(parse_plain(b"\0a\0b\0c").is_none(), "too many fields");
    }
}
