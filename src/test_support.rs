//! Shared helpers for unit tests

use crate::error::StoreError;
use crate::storage::{ArchiveStore, LocalArchive};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Local archive whose writes can be switched to fail
pub struct FlakyArchive {
    pub inner: LocalArchive,
    fail_writes: AtomicBool,
}

impl FlakyArchive {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalArchive::new(root),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArchiveStore for FlakyArchive {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.inner.exists(path).await
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(dir).await
    }

    async fn write(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "namenode unreachable",
            )));
        }
        self.inner.write(path, bytes, overwrite).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.read(path).await
    }

    async fn download(&self, path: &str, local_path: &Path) -> Result<(), StoreError> {
        self.inner.download(path, local_path).await
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        self.inner.delete(path).await
    }

    async fn makedirs(&self, path: &str) -> Result<(), StoreError> {
        self.inner.makedirs(path).await
    }

    fn backend_type(&self) -> &'static str {
        "flaky"
    }
}

/// Minimal HTTP/1.1 server answering every request with the same response
///
/// Returns the base URL (`http://127.0.0.1:<port>`) and the request paths
/// seen so far.
pub async fn http_stub(
    status: u16,
    body: &'static str,
) -> (String, std::sync::Arc<std::sync::Mutex<Vec<String>>>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let seen = seen_by_server.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                if let Some(path) = request.split_whitespace().nth(1) {
                    seen.lock().unwrap().push(path.to_string());
                }

                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), seen)
}
