//! WebHDFS archive backend
//!
//! Talks to the namenode REST gateway (`/webhdfs/v1`). Data operations
//! (`CREATE`, `OPEN`) are answered with a redirect to a datanode; redirects are
//! followed by hand so the request body is sent exactly once, to the datanode.
//!
//! ## API Reference
//!
//! - `GETFILESTATUS` (GET) - existence check, 404 when absent
//! - `LISTSTATUS` (GET) - `{"FileStatuses": {"FileStatus": [{"pathSuffix": ..}]}}`
//! - `CREATE` (PUT, two-step) - `overwrite=true|false`
//! - `OPEN` (GET, two-step)
//! - `DELETE` (DELETE) - `{"boolean": true|false}`
//! - `MKDIRS` (PUT) - `{"boolean": true}`

use super::ArchiveStore;
use crate::error::StoreError;
use async_trait::async_trait;
use reqwest::{header::LOCATION, redirect, Client, Method, Response, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ListStatusResponse {
    #[serde(rename = "FileStatuses")]
    file_statuses: FileStatuses,
}

#[derive(Debug, Deserialize)]
struct FileStatuses {
    #[serde(rename = "FileStatus", default)]
    file_status: Vec<FileStatus>,
}

#[derive(Debug, Deserialize)]
struct FileStatus {
    #[serde(rename = "pathSuffix")]
    path_suffix: String,
}

#[derive(Debug, Deserialize)]
struct BooleanResponse {
    boolean: bool,
}

pub struct WebHdfsArchive {
    client: Client,
    base_url: String,
    user: String,
}

impl WebHdfsArchive {
    /// Create a client for `base_url` (e.g. `http://namenode:9870`)
    pub fn new(base_url: &str, user: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
        })
    }

    fn op_url(&self, path: &str, op: &str, extra: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!(
            "{}/webhdfs/v1{}?op={}&user.name={}{}",
            self.base_url, path, op, self.user, extra
        )
    }

    async fn call(&self, method: Method, url: String) -> Result<Response, StoreError> {
        Ok(self.client.request(method, url).send().await?)
    }

    /// Extract the datanode location from a redirect answer
    fn redirect_target(response: &Response, operation: &'static str, path: &str) -> Result<String, StoreError> {
        if !response.status().is_redirection() {
            return Err(StoreError::Status {
                operation,
                path: path.to_string(),
                status: response.status().as_u16(),
            });
        }

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| StoreError::Status {
                operation,
                path: path.to_string(),
                status: response.status().as_u16(),
            })
    }

    fn unexpected(operation: &'static str, path: &str, status: StatusCode) -> StoreError {
        StoreError::Status {
            operation,
            path: path.to_string(),
            status: status.as_u16(),
        }
    }
}

#[async_trait]
impl ArchiveStore for WebHdfsArchive {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let response = self.call(Method::GET, self.op_url(path, "GETFILESTATUS", "")).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Self::unexpected("GETFILESTATUS", path, status)),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        let response = self.call(Method::GET, self.op_url(dir, "LISTSTATUS", "")).await?;
        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                parse_list_status(&body)
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(dir.to_string())),
            status => Err(Self::unexpected("LISTSTATUS", dir, status)),
        }
    }

    async fn write(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<(), StoreError> {
        let extra = format!("&overwrite={}", overwrite);
        let response = self.call(Method::PUT, self.op_url(path, "CREATE", &extra)).await?;
        let location = Self::redirect_target(&response, "CREATE", path)?;

        let response = self
            .client
            .put(location)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN if !overwrite => Err(StoreError::AlreadyExists(path.to_string())),
            status => Err(Self::unexpected("CREATE", path, status)),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let response = self.call(Method::GET, self.op_url(path, "OPEN", "")).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()));
        }

        // Small files may be served directly by the namenode
        let response = if response.status() == StatusCode::OK {
            response
        } else {
            let location = Self::redirect_target(&response, "OPEN", path)?;
            self.client.get(location).send().await?
        };

        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(path.to_string())),
            status => Err(Self::unexpected("OPEN", path, status)),
        }
    }

    async fn download(&self, path: &str, local_path: &Path) -> Result<(), StoreError> {
        let bytes = self.read(path).await?;
        tokio::fs::write(local_path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let response = self.call(Method::DELETE, self.op_url(path, "DELETE", "")).await?;
        match response.status() {
            StatusCode::OK => {
                let body: BooleanResponse = serde_json::from_str(&response.text().await?)?;
                Ok(body.boolean)
            }
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Self::unexpected("DELETE", path, status)),
        }
    }

    async fn makedirs(&self, path: &str) -> Result<(), StoreError> {
        let response = self.call(Method::PUT, self.op_url(path, "MKDIRS", "")).await?;
        match response.status() {
            StatusCode::OK => {
                let body: BooleanResponse = serde_json::from_str(&response.text().await?)?;
                if body.boolean {
                    Ok(())
                } else {
                    Err(Self::unexpected("MKDIRS", path, StatusCode::OK))
                }
            }
            status => Err(Self::unexpected("MKDIRS", path, status)),
        }
    }

    fn backend_type(&self) -> &'static str {
        "webhdfs"
    }
}

fn parse_list_status(body: &str) -> Result<Vec<String>, StoreError> {
    let parsed: ListStatusResponse = serde_json::from_str(body)?;
    let mut names: Vec<String> = parsed
        .file_statuses
        .file_status
        .into_iter()
        .map(|status| status.path_suffix)
        .collect();
    names.sort();
    Ok(names)
}
