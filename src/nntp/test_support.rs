//! Scripted in-process NNTP servers for transport tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::config::ServerConfig;

/// Counters exposed by a [`spawn_mock_server`] instance
pub(crate) struct MockServerStats {
    /// Connections accepted since startup
    pub(crate) accepts: Arc<AtomicUsize>,
    /// Currently open connections
    pub(crate) open: Arc<AtomicUsize>,
}

impl MockServerStats {
    pub(crate) fn accepted(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// Plaintext server config pointed at a mock server port
pub(crate) fn mock_server_config(id: &str, port: u16, max_connections: usize, priority: i32) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        username: None,
        password: None,
        tls: false,
        max_connections,
        priority,
    }
}

/// Spawn a minimal NNTP server: greets with 200, answers GROUP/DATE/QUIT,
/// and serves BODY from the `body_for` closure (None ⇒ 430). Runs until
/// the listener is dropped with the test runtime.
pub(crate) async fn spawn_mock_server(
    body_for: impl Fn(&str) -> Option<Vec<u8>> + Send + Sync + 'static,
) -> (u16, MockServerStats) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let open = Arc::new(AtomicUsize::new(0));
    let stats = MockServerStats {
        accepts: accepts.clone(),
        open: open.clone(),
    };
    let body_for = Arc::new(body_for);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            accepts.fetch_add(1, Ordering::SeqCst);
            open.fetch_add(1, Ordering::SeqCst);
            let body_for = body_for.clone();
            let open = open.clone();

            tokio::spawn(async move {
                let mut stream = BufReader::new(socket);
                stream
                    .get_mut()
                    .write_all(b"200 mock server ready\r\n")
                    .await
                    .ok();

                let mut line = String::new();
                loop {
                    line.clear();
                    if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                        break;
                    }
                    let cmd = line.trim_end();
                    if let Some(rest) = cmd.strip_prefix("BODY ") {
                        let id = rest.trim_start_matches('<').trim_end_matches('>');
                        match body_for(id) {
                            Some(payload) => {
                                stream
                                    .get_mut()
                                    .write_all(b"222 0 body follows\r\n")
                                    .await
                                    .ok();
                                stream.get_mut().write_all(&payload).await.ok();
                                stream.get_mut().write_all(b".\r\n").await.ok();
                            }
                            None => {
                                stream
                                    .get_mut()
                                    .write_all(b"430 no such article\r\n")
                                    .await
                                    .ok();
                            }
                        }
                    } else if cmd.starts_with("GROUP ") {
                        stream
                            .get_mut()
                            .write_all(b"211 100 1 100 group selected\r\n")
                            .await
                            .ok();
                    } else if cmd == "DATE" {
                        stream
                            .get_mut()
                            .write_all(b"111 20260802120000\r\n")
                            .await
                            .ok();
                    } else if cmd == "QUIT" {
                        stream.get_mut().write_all(b"205 bye\r\n").await.ok();
                        break;
                    } else {
                        stream.get_mut().write_all(b"500 what\r\n").await.ok();
                    }
                }
                open.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    (port, stats)
}
