//! Single NNTP connection: dial, authenticate, speak the command subset
//!
//! Covers exactly the verbs the engine needs — `AUTHINFO`, `GROUP`,
//! `BODY`, `DATE`, `QUIT` — over TCP or implicit TLS. Body payloads are
//! dot-stuffed blocks terminated by a lone `.` line; [`DotDecoder`]
//! un-stuffs them and detects the terminator.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Plaintext or TLS transport under one connection
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One authenticated NNTP session
pub(crate) struct NntpConnection {
    stream: BufStream<Stream>,
}

impl NntpConnection {
    /// Dial, read the greeting (200 or 201), and authenticate when
    /// credentials are configured. TLS sockets are wrapped before the
    /// greeting; minimum protocol version is TLS 1.2 and the certificate
    /// is verified against the configured hostname.
    pub(crate) async fn connect(config: &ServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);

        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Transport(format!("dial timeout connecting to {addr}")))?
            .map_err(|e| Error::Transport(format!("dial {addr} failed: {e}")))?;

        let stream = if config.tls {
            // rustls' safe defaults negotiate TLS 1.2 or 1.3 only
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();

            let server_name = ServerName::try_from(config.host.clone())
                .map_err(|e| Error::Transport(format!("invalid TLS hostname: {e}")))?;

            let connector = TlsConnector::from(Arc::new(tls_config));
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::Transport(format!("TLS handshake with {addr} failed: {e}")))?;
            Stream::Tls(Box::new(tls))
        } else {
            Stream::Plain(tcp)
        };

        let mut conn = NntpConnection {
            stream: BufStream::new(stream),
        };

        let (code, line) = conn.read_response().await?;
        if code != 200 && code != 201 {
            return Err(Error::Transport(format!("unexpected greeting: {code} {line}")));
        }

        conn.authenticate(config).await?;
        Ok(conn)
    }

    async fn authenticate(&mut self, config: &ServerConfig) -> Result<()> {
        let Some(username) = config.username.as_deref() else {
            return Ok(());
        };

        let (code, line) = self.command(&format!("AUTHINFO USER {username}")).await?;
        if code != 381 {
            return Err(Error::Transport(format!(
                "AUTHINFO USER rejected: {code} {line}"
            )));
        }

        let password = config.password.as_deref().unwrap_or("");
        let (code, line) = self.command(&format!("AUTHINFO PASS {password}")).await?;
        if code != 281 {
            return Err(Error::Transport(format!(
                "authentication failed: {code} {line}"
            )));
        }
        Ok(())
    }

    /// Send one command line and read the status reply
    pub(crate) async fn command(&mut self, line: &str) -> Result<(u16, String)> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_response().await
    }

    /// Read a CRLF-terminated status line, returning (code, rest)
    pub(crate) async fn read_response(&mut self) -> Result<(u16, String)> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(Error::Transport("connection closed by server".into()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let code: u16 = trimmed
            .get(..3)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Transport(format!("malformed reply: {trimmed}")))?;
        let rest = trimmed.get(3..).unwrap_or("").trim_start().to_string();
        Ok((code, rest))
    }

    /// Keepalive/liveness probe: `DATE` must answer `111 yyyymmddhhmmss`
    pub(crate) async fn date(&mut self) -> Result<String> {
        let (code, line) = self.command("DATE").await?;
        if code != 111 {
            return Err(Error::Transport(format!("DATE failed: {code} {line}")));
        }
        Ok(line)
    }

    /// Best-effort QUIT; errors are ignored because the socket is about
    /// to be dropped either way
    pub(crate) async fn quit(&mut self) {
        let _ = self.command("QUIT").await;
    }

    pub(crate) fn stream_mut(&mut self) -> &mut BufStream<Stream> {
        &mut self.stream
    }
}

/// Where the dot-decoder is within the framing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DotState {
    /// At the start of a line
    LineStart,
    /// Mid-line
    Data,
    /// Saw `.` at a line start — stuffing or terminator
    DotAtLineStart,
    /// Saw `.` then CR — one byte short of the terminator
    DotCr,
}

/// Incremental un-dot-stuffing over a dot-terminated NNTP block.
///
/// Lines beginning with `.` were doubled on the wire; the terminator is
/// a line containing a single `.`. State persists across calls so the
/// transport may chunk the stream arbitrarily.
#[derive(Debug)]
pub(crate) struct DotDecoder {
    state: DotState,
    done: bool,
}

impl DotDecoder {
    pub(crate) fn new() -> Self {
        DotDecoder {
            state: DotState::LineStart,
            done: false,
        }
    }

    /// Terminator seen — the block is complete
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Consume bytes from `input`, writing unstuffed output into `out`.
    /// Returns `(consumed, produced)`. Stops at the terminator, when
    /// `out` is full, or when `input` is exhausted.
    pub(crate) fn decode(&mut self, input: &[u8], out: &mut [u8]) -> (usize, usize) {
        let mut consumed = 0;
        let mut produced = 0;

        while consumed < input.len() && !self.done {
            let b = input[consumed];
            match self.state {
                DotState::LineStart => {
                    if b == b'.' {
                        self.state = DotState::DotAtLineStart;
                        consumed += 1;
                        continue;
                    }
                    if produced == out.len() {
                        break;
                    }
                    out[produced] = b;
                    produced += 1;
                    consumed += 1;
                    self.state = if b == b'\n' {
                        DotState::LineStart
                    } else {
                        DotState::Data
                    };
                }
                DotState::Data => {
                    if produced == out.len() {
                        break;
                    }
                    out[produced] = b;
                    produced += 1;
                    consumed += 1;
                    if b == b'\n' {
                        self.state = DotState::LineStart;
                    }
                }
                DotState::DotAtLineStart => {
                    if b == b'\r' {
                        self.state = DotState::DotCr;
                        consumed += 1;
                    } else if b == b'\n' {
                        // lenient bare-LF terminator
                        self.done = true;
                        consumed += 1;
                    } else {
                        // stuffed dot: the leading '.' is dropped, this
                        // byte is ordinary data
                        if produced == out.len() {
                            break;
                        }
                        out[produced] = b;
                        produced += 1;
                        consumed += 1;
                        self.state = if b == b'\n' {
                            DotState::LineStart
                        } else {
                            DotState::Data
                        };
                    }
                }
                DotState::DotCr => {
                    if b == b'\n' {
                        self.done = true;
                        consumed += 1;
                    } else {
                        // ".\r" not followed by LF cannot occur in valid
                        // framing; emit the swallowed CR and carry on
                        if produced == out.len() {
                            break;
                        }
                        out[produced] = b'\r';
                        produced += 1;
                        self.state = DotState::Data;
                    }
                }
            }
        }

        (consumed, produced)
    }
}
