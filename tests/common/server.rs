//! Scripted in-process NNTP servers

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use nzb_dl::config::ServerConfig;

/// Handle to a running mock server
pub struct MockNntpServer {
    /// Bound port
    pub port: u16,
    /// Connections accepted since startup
    pub accepts: Arc<AtomicUsize>,
    /// Message-ids requested via BODY, in arrival order
    pub body_requests: Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockNntpServer {
    /// Server config pointing at this mock
    pub fn config(&self, id: &str, max_connections: usize, priority: i32) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: self.port,
            username: None,
            password: None,
            tls: false,
            max_connections,
            priority,
        }
    }

    /// Ids requested so far
    pub fn requested_ids(&self) -> Vec<String> {
        self.body_requests
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

/// Spawn a minimal NNTP server. It greets with 200, answers
/// GROUP/DATE/QUIT, and serves BODY payloads from `body_for`
/// (`None` ⇒ 430). `delay` is applied before each BODY reply.
pub async fn spawn_server(
    delay: Duration,
    body_for: impl Fn(&str) -> Option<Vec<u8>> + Send + Sync + 'static,
) -> MockNntpServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let body_requests = Arc::new(std::sync::Mutex::new(Vec::new()));
    let server = MockNntpServer {
        port,
        accepts: accepts.clone(),
        body_requests: body_requests.clone(),
    };
    let body_for = Arc::new(body_for);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            accepts.fetch_add(1, Ordering::SeqCst);
            let body_for = body_for.clone();
            let body_requests = body_requests.clone();

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
                        let id = rest
                            .trim_start_matches('<')
                            .trim_end_matches('>')
                            .to_string();
                        if let Ok(mut requests) = body_requests.lock() {
                            requests.push(id.clone());
                        }
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        match body_for(&id) {
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
            });
        }
    });

    server
}
