//! Handoff to the queue child.
//!
//! The child gets the dot-unstuffed message body on its fd 0 and the
//! envelope on its fd 1; the parent writes the body first, closes it,
//! then the envelope, then waits. Its exit code selects the final SMTP
//! reply for the transaction.

use std::{
    fs,
    io::{self, Write},
    os::unix::io::FromRawFd,
    path::PathBuf,
    process,
};

use async_trait::async_trait;
use futures::io::AsyncWriteExt;

/// Serialize the envelope: `F<from>\0` then `T<rcpt>\0` per accepted
/// recipient, closed by one more NUL.
pub fn write_envelope(out: &mut Vec<u8>, from: Option<&str>, rcpts: &[&str]) {
    out.push(b'F');
    if let Some(f) = from {
        out.extend_from_slice(f.as_bytes());
    }
    out.push(0);
    for r in rcpts {
        out.push(b'T');
        out.extend_from_slice(r.as_bytes());
        out.push(0);
    }
    out.push(0);
}

/// Translate the child's exit code into the transaction reply.
pub fn reply_for_exit(code: i32) -> &'static str {
    match code {
        0 => "250 2.5.0 message queued",
        11 => "554 5.1.3 envelope address too long for queue",
        31 => "554 5.3.0 mail server permanently rejected message",
        51 => "451 4.3.0 queue out of memory",
        52 => "451 4.3.2 queue timeout",
        53 => "451 4.3.2 queue write error or disk full",
        54 => "451 4.3.0 queue read error",
        61 => "451 4.3.0 queue trouble in home directory",
        62..=66 => "451 4.3.0 queue trouble creating files",
        81 => "451 4.3.0 internal bug in queue",
        91 => "451 4.3.0 queue rejected envelope format",
        11..=40 => "554 5.3.0 queue permanent problem",
        _ => "451 4.3.0 temporary queue failure",
    }
}

/// One queued message in flight.
#[async_trait]
pub trait QueueHandle: Send {
    async fn body(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Close the body, deliver the envelope, reap the child, return its
    /// exit code.
    async fn finish(self: Box<Self>, envelope: &[u8]) -> io::Result<i32>;

    /// Drop the message: close both pipes and reap the child.
    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn begin(&self) -> io::Result<Box<dyn QueueHandle>>;
}

/// The production queue: spawns the configured child binary per
/// message.
pub struct ChildQueue {
    binary: PathBuf,
}

impl ChildQueue {
    pub fn new(binary: PathBuf) -> ChildQueue {
        ChildQueue { binary }
    }
}

struct ChildHandle {
    child: process::Child,
    body: Option<smol::Unblock<process::ChildStdin>>,
    envelope: Option<fs::File>,
}

fn cloexec_pipe() -> io::Result<(fs::File, fs::File)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((fs::File::from_raw_fd(fds[0]), fs::File::from_raw_fd(fds[1]))) }
}

#[async_trait]
impl Queue for ChildQueue {
    async fn begin(&self) -> io::Result<Box<dyn QueueHandle>> {
        let (env_read, env_write) = cloexec_pipe()?;
        let mut cmd = process::Command::new(&self.binary);
        cmd.stdin(process::Stdio::piped())
            .stdout(process::Stdio::from(env_read))
            .stderr(process::Stdio::inherit());
        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "queue child has no stdin"))?;
        Ok(Box::new(ChildHandle {
            child,
            body: Some(smol::Unblock::new(stdin)),
            envelope: Some(env_write),
        }))
    }
}

#[async_trait]
impl QueueHandle for ChildHandle {
    async fn body(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.body.as_mut() {
            Some(w) => w.write_all(chunk).await,
            None => Err(io::Error::new(io::ErrorKind::Other, "body already closed")),
        }
    }

    async fn finish(mut self: Box<Self>, envelope: &[u8]) -> io::Result<i32> {
        if let Some(mut w) = self.body.take() {
            w.flush().await?;
            // dropping closes the child's fd 0
        }
        let env = envelope.to_vec();
        let mut pipe = self
            .envelope
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "envelope already sent"))?;
        let mut child = self.child;
        smol::unblock(move || -> io::Result<i32> {
            pipe.write_all(&env)?;
            drop(pipe);
            let status = child.wait()?;
            Ok(status.code().unwrap_or(-1))
        })
        .await
    }

    async fn abort(mut self: Box<Self>) {
        drop(self.body.take());
        drop(self.envelope.take());
        let mut child = self.child;
        let _ = smol::unblock(move || child.wait()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_bytes_are_exact() {
        let mut out = Vec::new();
        write_envelope(
            &mut out,
            Some("from@example.org"),
            &["r1@example.org", "r2@example.org", "r3@example.org"],
        );
        assert_eq!(
            out,
            b"Ffrom@example.org\0Tr1@example.org\0Tr2@example.org\0Tr3@example.org\0\0"
        );
    }

    #[test]
    fn bounce_envelope_has_empty_sender() {
        let mut out = Vec::new();
        write_envelope(&mut out, None, &["r@example.org"]);
        assert_eq!(out, b"F\0Tr@example.org\0\0");
    }

    #[test]
    fn exit_codes_map_to_replies() {
        assert!(reply_for_exit(0).starts_with("250"));
        assert!(reply_for_exit(11).starts_with("554 5.1.3"));
        assert!(reply_for_exit(31).starts_with("554 5.3.0"));
        for code in &[51, 52, 53, 54, 61, 62, 66, 81, 91] {
            assert!(reply_for_exit(*code).starts_with("451 4.3."), "code {}", code);
        }
        // unknown codes in 11..=40 are permanent, others temporary
        assert!(reply_for_exit(23).starts_with("554"));
        assert!(reply_for_exit(42).starts_with("451"));
        assert!(reply_for_exit(-1).starts_with("451"));
    }
}
