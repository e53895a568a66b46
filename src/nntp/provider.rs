//! NNTP provider: pooled connections to one server
//!
//! A provider owns a bounded pool of idle, authenticated connections.
//! `fetch` leases a connection (dialing when the pool is empty), issues
//! `BODY`, and hands back a [`BodyReader`] that streams the
//! dot-unstuffed payload. Closing the reader drains to the terminator
//! (capped at two seconds) and recycles the connection; dropping it
//! without a close discards the socket instead.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt};

use super::connection::{DotDecoder, NntpConnection};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Contract for a Usenet server the engine can fetch articles from.
///
/// NNTP is the only implementation today; the trait is the seam where
/// another article source would plug in.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique id used in failover bookkeeping
    fn id(&self) -> &str;

    /// Lower is tried first
    fn priority(&self) -> i32;

    /// Connection budget for this server
    fn max_connections(&self) -> usize;

    /// Fetch an article body. `groups` is a hint; the first entry is
    /// selected with `GROUP` before `BODY` when present.
    async fn fetch(&self, message_id: &str, groups: &[String]) -> Result<BodyReader>;

    /// Dial, authenticate, and probe with `DATE`. Startup-only check
    /// that surfaces broken credentials as configuration errors.
    async fn test_connection(&self) -> Result<()>;

    /// Drain the idle pool, sending `QUIT` per connection
    async fn close(&self);
}

/// Bounded pool of idle connections: dial on empty, discard on overflow
struct ConnectionPool {
    config: ServerConfig,
    idle: tokio::sync::Mutex<Vec<NntpConnection>>,
    max: usize,
}

impl ConnectionPool {
    fn new(config: ServerConfig) -> Self {
        let max = config.max_connections;
        ConnectionPool {
            config,
            idle: tokio::sync::Mutex::new(Vec::with_capacity(max)),
            max,
        }
    }

    async fn get(&self) -> Result<NntpConnection> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        NntpConnection::connect(&self.config).await
    }

    async fn put(&self, conn: NntpConnection) {
        let mut conn = conn;
        {
            let mut idle = self.idle.lock().await;
            if idle.len() < self.max {
                idle.push(conn);
                return;
            }
        }
        // overflow: let the server release the slot immediately
        conn.quit().await;
    }

    async fn close(&self) {
        let mut idle = self.idle.lock().await;
        for mut conn in idle.drain(..) {
            conn.quit().await;
        }
    }
}

/// One NNTP server with its connection pool
pub struct NntpProvider {
    config: ServerConfig,
    pool: Arc<ConnectionPool>,
}

impl NntpProvider {
    /// Build a provider from validated server configuration
    pub fn new(config: ServerConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        NntpProvider { config, pool }
    }
}

#[async_trait]
impl Provider for NntpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn priority(&self) -> i32 {
        self.config.priority
    }

    fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    async fn fetch(&self, message_id: &str, groups: &[String]) -> Result<BodyReader> {
        let mut conn = self.pool.get().await?;

        if let Some(group) = groups.first() {
            // BODY addresses the article by message-id, which works
            // without group context on every major server; a refused
            // GROUP is logged and the fetch continues.
            let (code, line) = conn.command(&format!("GROUP {group}")).await?;
            if code != 211 {
                tracing::debug!(
                    provider = %self.config.id,
                    group = %group,
                    code,
                    reply = %line,
                    "GROUP refused, continuing with BODY"
                );
            }
        }

        // Stored ids are bracket-free; the wire form adds the brackets
        let id = message_id.trim_start_matches('<').trim_end_matches('>');
        let (code, line) = conn.command(&format!("BODY <{id}>")).await?;

        if code == 430 || line.to_ascii_lowercase().contains("no such article") {
            // the protocol exchange completed cleanly, keep the socket
            self.pool.put(conn).await;
            return Err(Error::ArticleNotFound);
        }
        if code != 222 {
            return Err(Error::Transport(format!("BODY <{id}> failed: {code} {line}")));
        }

        Ok(BodyReader::new(conn, self.pool.clone()))
    }

    async fn test_connection(&self) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Config {
                message: format!("connection test failed for {}: {e}", self.config.id),
                key: Some(format!("servers.{}", self.config.id)),
            })?;

        conn.date().await.map_err(|e| Error::Config {
            message: format!("connection test failed for {}: {e}", self.config.id),
            key: Some(format!("servers.{}", self.config.id)),
        })?;

        self.pool.put(conn).await;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Streaming, dot-unstuffed article body.
///
/// Implements [`AsyncRead`]; EOF is reported at the `.` terminator (or
/// at an early server close, which marks the stream truncated so the
/// connection is not recycled).
pub struct BodyReader {
    conn: Option<NntpConnection>,
    pool: Arc<ConnectionPool>,
    dot: DotDecoder,
    truncated: bool,
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader").finish_non_exhaustive()
    }
}

impl BodyReader {
    fn new(conn: NntpConnection, pool: Arc<ConnectionPool>) -> Self {
        BodyReader {
            conn: Some(conn),
            pool,
            dot: DotDecoder::new(),
            truncated: false,
        }
    }

    /// Drain any unread remainder (bounded by a 2 s deadline) and return
    /// the connection to the pool. A failed or truncated drain closes
    /// the socket instead of recycling it.
    pub async fn close(mut self) {
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            let mut sink = [0u8; 4096];
            loop {
                match self.read(&mut sink).await {
                    Ok(0) => break true,
                    Ok(_) => {}
                    Err(_) => break false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if drained && self.dot.is_done() && !self.truncated {
            if let Some(conn) = self.conn.take() {
                self.pool.put(conn).await;
            }
        }
        // dropping self closes any remaining socket
    }
}

impl AsyncRead for BodyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.dot.is_done() || this.truncated {
            return Poll::Ready(Ok(()));
        }
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            let stream = conn.stream_mut();
            let chunk = match Pin::new(&mut *stream).poll_fill_buf(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(chunk)) => chunk,
            };

            if chunk.is_empty() {
                // server hung up before the terminator
                this.truncated = true;
                return Poll::Ready(Ok(()));
            }

            let out = buf.initialize_unfilled();
            let (consumed, produced) = this.dot.decode(chunk, out);
            Pin::new(&mut *stream).consume(consumed);

            if produced > 0 {
                buf.advance(produced);
                return Poll::Ready(Ok(()));
            }
            if this.dot.is_done() {
                return Poll::Ready(Ok(()));
            }
            // only framing bytes were consumed; keep filling
        }
    }
}
