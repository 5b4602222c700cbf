use std::{io, pin::Pin, task::Poll, time::Duration};

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum number of content bytes in one logical line, CRLF excluded.
pub const LINE_LIMIT: usize = 1000;

/// Maximum length of one reply line, CRLF excluded.
pub const REPLY_LIMIT: usize = 510;

const BUF_SIZE: usize = LINE_LIMIT + 2;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("line too long")]
    TooLong,

    #[error("stray CR or LF in input")]
    Stray,

    #[error("connection timed out")]
    TimedOut,

    #[error("connection closed by peer")]
    Closed,

    #[error("network I/O")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Read-side errors that mean the peer is gone and the session cannot
    /// continue, as opposed to recoverable framing problems.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NetError::TooLong | NetError::Stray)
    }
}

enum Eol {
    /// No CR and no LF anywhere in the buffer.
    None,
    /// A proper CRLF; the index is one past the LF.
    Valid(usize),
    /// A stray CR or LF; the index is one past the offending sequence.
    Broken(usize),
}

/// Locate the end of the first line in `buf`, mirroring the tolerant
/// scan the session recovery logic needs: a lone CR as the very last
/// byte is reported as `Broken(len)` so the caller can wait for a
/// possible LF in the next read.
fn find_eol(buf: &[u8]) -> Eol {
    let cr = buf.iter().position(|&b| b == b'\r');
    let lf = buf.iter().position(|&b| b == b'\n');
    match (cr, lf) {
        (Some(c), Some(l)) if l == c + 1 => Eol::Valid(l + 1),
        (None, None) => Eol::None,
        (None, Some(l)) => Eol::Broken(l + 1),
        (Some(c), None) => Eol::Broken(c + 1),
        (Some(c), Some(l)) if c < l => {
            // the LF may itself be the end of a valid CRLF further on
            if buf[l - 1] != b'\r' {
                Eol::Broken(l + 1)
            } else {
                Eol::Broken(c + 1)
            }
        }
        (Some(c), Some(l)) => {
            // LF before CR; check whether the CR is also stray
            if c + 2 <= buf.len() && buf.get(c + 1) != Some(&b'\n') {
                Eol::Broken(c + 1)
            } else {
                Eol::Broken(l + 1)
            }
        }
    }
}

/// CRLF-framed I/O over one session stream, cleartext or TLS.
///
/// Bytes read past the first CRLF are kept in a pushback buffer and serve
/// subsequent reads; this is what makes inbound pipelining work. Every
/// read and write races the session-wide timeout.
pub struct NetIo<IO> {
    io: IO,
    timeout: Duration,
    line: Vec<u8>,
    pending: Vec<u8>,
}

impl<IO> NetIo<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: IO, timeout: Duration) -> NetIo<IO> {
        NetIo {
            io,
            timeout,
            line: Vec::with_capacity(BUF_SIZE),
            pending: Vec::new(),
        }
    }

    /// The last line successfully read, CRLF stripped.
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Swap the underlying stream, for STARTTLS. Pipelined cleartext data
    /// must not survive into the TLS session, so the pushback is dropped.
    pub fn replace_stream(&mut self, io: IO) -> IO {
        self.pending.clear();
        std::mem::replace(&mut self.io, io)
    }

    pub fn stream_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        let timeout = self.timeout;
        let io = &mut self.io;
        let n = smol::future::or(
            async { io.read(buf).await.map_err(NetError::Io) },
            async {
                smol::Timer::after(timeout).await;
                Err(NetError::TimedOut)
            },
        )
        .await?;
        if n == 0 {
            return Err(NetError::Closed);
        }
        Ok(n)
    }

    /// Read one CRLF-terminated logical line into the line buffer.
    ///
    /// `TooLong` and `Stray` both consume the offending input up to the
    /// next valid line boundary before returning, so the session can keep
    /// going; everything else is fatal.
    pub async fn read_line(&mut self) -> Result<(), NetError> {
        self.line.clear();
        let mut acc = [0u8; BUF_SIZE];
        let mut len = 0;

        if !self.pending.is_empty() {
            match find_eol(&self.pending) {
                Eol::Valid(end) => {
                    self.line.extend_from_slice(&self.pending[..end - 2]);
                    self.pending.drain(..end);
                    return Ok(());
                }
                Eol::None => {
                    len = self.pending.len().min(BUF_SIZE);
                    acc[..len].copy_from_slice(&self.pending[..len]);
                    self.pending.clear();
                }
                Eol::Broken(end) if end == self.pending.len() && self.pending[end - 1] == b'\r' => {
                    // lone CR at the very end: the LF may still be in flight
                    len = self.pending.len().min(BUF_SIZE);
                    acc[..len].copy_from_slice(&self.pending[..len]);
                    self.pending.clear();
                }
                Eol::Broken(end) => {
                    self.pending.drain(..end);
                    return Err(NetError::Stray);
                }
            }
        }

        loop {
            if len == BUF_SIZE {
                // buffer full without a terminator
                return self.recover_long(acc[len - 1] == b'\r').await;
            }
            let n = self.read_some(&mut acc[len..]).await?;
            len += n;
            match find_eol(&acc[..len]) {
                Eol::Valid(end) => {
                    self.line.extend_from_slice(&acc[..end - 2]);
                    self.pending.extend_from_slice(&acc[end..len]);
                    return Ok(());
                }
                Eol::None => continue,
                Eol::Broken(end) if end == len && acc[len - 1] == b'\r' => continue,
                Eol::Broken(end) => {
                    self.pending.extend_from_slice(&acc[end..len]);
                    return Err(NetError::Stray);
                }
            }
        }
    }

    /// A line overflowed the buffer: drop input until the next valid CRLF,
    /// keep whatever follows it, and report the overflow.
    async fn recover_long(&mut self, mut has_cr: bool) -> Result<(), NetError> {
        let mut buf = [0u8; BUF_SIZE];
        loop {
            let n = self.read_some(&mut buf).await?;
            if has_cr && buf[0] == b'\n' {
                self.pending.extend_from_slice(&buf[1..n]);
                return Err(NetError::TooLong);
            }
            if let Some(p) = buf[..n].windows(2).position(|w| w == b"\r\n") {
                self.pending.extend_from_slice(&buf[p + 2..n]);
                return Err(NetError::TooLong);
            }
            has_cr = buf[n - 1] == b'\r';
        }
    }

    /// Write one raw line; the caller supplies the CRLF.
    pub async fn write_line(&mut self, buf: &[u8]) -> Result<(), NetError> {
        let timeout = self.timeout;
        let io = &mut self.io;
        smol::future::or(
            async {
                io.write_all(buf).await.map_err(NetError::Io)?;
                io.flush().await.map_err(NetError::Io)
            },
            async {
                smol::Timer::after(timeout).await;
                Err(NetError::TimedOut)
            },
        )
        .await
    }

    /// Write a reply assembled from segments, folding into `XYZ-`
    /// continuation lines when it would overflow one reply line.
    ///
    /// The joined segments must start with a three-digit code and a space
    /// or dash; the continuation prefix is taken from there.
    pub async fn write_multiline(&mut self, segments: &[&str]) -> Result<(), NetError> {
        let mut msg = String::new();
        for s in segments {
            msg.push_str(s);
        }
        if msg.len() <= REPLY_LIMIT {
            msg.push_str("\r\n");
            return self.write_line(msg.as_bytes()).await;
        }

        let code = msg[..3].to_owned();
        let body = &msg[4..];
        let mut out = Vec::new();
        let mut cur = String::new();
        for w in body.split(' ') {
            if !cur.is_empty() && cur.len() + 1 + w.len() > REPLY_LIMIT - 4 {
                out.push(std::mem::take(&mut cur));
            }
            if !cur.is_empty() {
                cur.push(' ');
            }
            cur.push_str(w);
        }
        out.push(cur);
        let last = out.len() - 1;
        let mut wire = String::new();
        for (i, l) in out.iter().enumerate() {
            wire.push_str(&code);
            wire.push(if i == last { ' ' } else { '-' });
            wire.push_str(l);
            wire.push_str("\r\n");
        }
        self.write_line(wire.as_bytes()).await
    }

    /// Read exactly `buf.len()` bytes, unframed. Used for BDAT chunks.
    pub async fn read_binary(&mut self, buf: &mut [u8]) -> Result<(), NetError> {
        let mut offs = 0;
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            offs = n;
        }
        while offs < buf.len() {
            let n = self.read_some(&mut buf[offs..]).await?;
            offs += n;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes but stop after the first LF; bytes
    /// beyond the LF go back into the pushback buffer.
    pub async fn read_until_lf(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        let mut offs = 0;
        if !self.pending.is_empty() {
            let mut n = self.pending.len().min(buf.len());
            if let Some(l) = self.pending[..n].iter().position(|&b| b == b'\n') {
                n = l + 1;
            }
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            if buf[..n].last() == Some(&b'\n') {
                return Ok(n);
            }
            offs = n;
        }
        while offs < buf.len() {
            let n = self.read_some(&mut buf[offs..]).await?;
            if let Some(l) = buf[offs..offs + n].iter().position(|&b| b == b'\n') {
                let rest = offs + l + 1..offs + n;
                self.pending.extend_from_slice(&buf[rest.clone()]);
                return Ok(offs + l + 1);
            }
            offs += n;
        }
        Ok(offs)
    }

    /// Whether a byte is buffered or readable without blocking.
    pub async fn has_pending(&mut self) -> Result<bool, NetError> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        let mut buf = [0u8; 512];
        let io = &mut self.io;
        let polled = futures::future::poll_fn(|cx| match Pin::new(&mut *io).poll_read(cx, &mut buf)
        {
            Poll::Ready(r) => Poll::Ready(Some(r)),
            Poll::Pending => Poll::Ready(None),
        })
        .await;
        match polled {
            None | Some(Ok(0)) => Ok(false),
            Some(Ok(n)) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(true)
            }
            Some(Err(e)) => Err(NetError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{executor, io::Cursor};

    fn io_from(input: &[u8]) -> NetIo<futures::io::Cursor<Vec<u8>>> {
        NetIo::new(Cursor::new(input.to_vec()), Duration::from_secs(5))
    }

    #[test]
    fn reads_line_and_preserves_pipeline() {
        executor::block_on(async {
            let mut io = io_from(b"NOOP\r\nRSET\r\nQUIT\r\n");
            io.read_line().await.unwrap();
            assert_eq!(io.line(), b"NOOP");
            assert!(io.has_pending().await.unwrap());
            io.read_line().await.unwrap();
            assert_eq!(io.line(), b"RSET");
            io.read_line().await.unwrap();
            assert_eq!(io.line(), b"QUIT");
        });
    }

    #[test]
    fn stray_lf_is_an_error_but_recovers() {
        executor::block_on(async {
            let mut io = io_from(b"bare\nMAIL FROM:<a@b.example>\r\n");
            assert!(matches!(io.read_line().await, Err(NetError::Stray)));
            io.read_line().await.unwrap();
            assert_eq!(io.line(), b"MAIL FROM:<a@b.example>");
        });
    }

    #[test]
    fn stray_cr_is_an_error_but_recovers() {
        executor::block_on(async {
            let mut io = io_from(b"br\roken\r\nNOOP\r\n");
            assert!(matches!(io.read_line().await, Err(NetError::Stray)));
            // everything up to the stray CR is dropped; the rest of that
            // chunk is served next
            io.read_line().await.unwrap();
            assert_eq!(io.line(), b"oken");
            io.read_line().await.unwrap();
            assert_eq!(io.line(), b"NOOP");
        });
    }

    #[test]
    fn long_line_consumes_to_next_crlf() {
        executor::block_on(async {
            let mut long = vec![b'x'; 1500];
            long.extend_from_slice(b"\r\nNOOP\r\n");
            let mut io = io_from(&long);
            assert!(matches!(io.read_line().await, Err(NetError::TooLong)));
            io.read_line().await.unwrap();
            assert_eq!(io.line(), b"NOOP");
        });
    }

    #[test]
    fn line_of_exactly_limit_is_fine() {
        executor::block_on(async {
            let mut l = vec![b'y'; LINE_LIMIT];
            l.extend_from_slice(b"\r\n");
            let mut io = io_from(&l);
            io.read_line().await.unwrap();
            assert_eq!(io.line().len(), LINE_LIMIT);
        });
    }

    #[test]
    fn eof_is_closed() {
        executor::block_on(async {
            let mut io = io_from(b"");
            assert!(matches!(io.read_line().await, Err(NetError::Closed)));
        });
    }

    #[test]
    fn read_until_lf_stops_at_lf_and_pushes_back() {
        executor::block_on(async {
            let mut io = io_from(b"line one\nline two\n");
            let mut buf = [0u8; 64];
            let n = io.read_until_lf(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"line one\n");
            let n = io.read_until_lf(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"line two\n");
        });
    }

    #[test]
    fn read_binary_drains_pushback_first() {
        executor::block_on(async {
            let mut io = io_from(b"HEAD\r\ntail-data");
            io.read_line().await.unwrap();
            let mut buf = [0u8; 9];
            io.read_binary(&mut buf).await.unwrap();
            assert_eq!(&buf, b"tail-data");
        });
    }

    #[test]
    fn multiline_folding_keeps_lines_bounded() {
        executor::block_on(async {
            let words = vec!["w"; 400].join(" word-that-is-longish ");
            let out: Vec<u8> = Vec::new();
            let mut io = NetIo::new(Cursor::new(out), Duration::from_secs(5));
            io.write_multiline(&["550 5.7.1 rejected: ", &words])
                .await
                .unwrap();
            let wire = io.replace_stream(Cursor::new(Vec::new())).into_inner();
            let text = String::from_utf8(wire).unwrap();
            let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
            assert!(lines.len() > 1);
            for (i, l) in lines.iter().enumerate() {
                assert!(l.len() <= REPLY_LIMIT);
                assert!(l.starts_with("550"));
                if i + 1 == lines.len() {
                    assert_eq!(&l[3..4], " ");
                } else {
                    assert_eq!(&l[3..4], "-");
                }
            }
        });
    }

    mod framing_roundtrip {
        use super::*;
        use quickcheck_macros::quickcheck;

        #[quickcheck]
        fn roundtrips(payload: Vec<u8>) -> bool {
            let mut payload: Vec<u8> = payload
                .into_iter()
                .filter(|&b| b != b'\r' && b != b'\n')
                .collect();
            payload.truncate(LINE_LIMIT);
            let mut wire = payload.clone();
            wire.extend_from_slice(b"\r\n");
            executor::block_on(async {
                let mut io = io_from(&wire);
                io.read_line().await.unwrap();
                io.line() == &payload[..]
            })
        }
    }
}
