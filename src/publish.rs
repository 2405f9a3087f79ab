//! Archival of the credential artifact to remote object storage.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Readable source handed to a publisher.
pub type ArtifactSource = Box<dyn AsyncRead + Send + Sync + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("could not read artifact: {0}")]
    Source(#[from] std::io::Error),
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage rejected upload with status {0}")]
    Rejected(u16),
    #[error("storage response carried no link")]
    MissingLink,
    #[error("no storage endpoint configured")]
    NotConfigured,
}

/// Uploads an artifact and returns a shareable link to it.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn upload(&self, source: ArtifactSource, name: &str) -> Result<String, UploadError>;
}

/// Publishes to an HTTP object store: `PUT <endpoint>/<name>` with the
/// artifact as a streamed body. The link is read from a JSON body
/// (`{"url": ...}` or `{"link": ...}`) or, failing that, the `Location`
/// header.
pub struct HttpArtifactPublisher {
    client: reqwest::Client,
    endpoint: Option<String>,
    token: Option<String>,
}

impl HttpArtifactPublisher {
    pub fn new(endpoint: Option<String>, token: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            token,
        })
    }
}

#[async_trait]
impl ArtifactPublisher for HttpArtifactPublisher {
    async fn upload(&self, source: ArtifactSource, name: &str) -> Result<String, UploadError> {
        let endpoint = self.endpoint.as_deref().ok_or(UploadError::NotConfigured)?;
        let url = format!("{endpoint}/{name}");
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(source));

        let mut req = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Rejected(status.as_u16()));
        }
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        body.get("url")
            .or_else(|| body.get("link"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .or(location)
            .ok_or(UploadError::MissingLink)
    }
}

/// Turn an upload link into the short reference code given to the user:
/// `<prefix>~<code>`, where `<code>` is the path segment after `/file/`,
/// else the last non-empty path segment, else `error`.
pub fn reference_code(prefix: &str, url: &str) -> String {
    let code = match url.split_once("/file/") {
        Some((_, rest)) => rest.split(['/', '#', '?']).next().filter(|s| !s.is_empty()),
        None => {
            let path = url
                .split_once("://")
                .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or(""))
                .unwrap_or(url);
            path.split(['#', '?'])
                .next()
                .and_then(|p| p.split('/').filter(|s| !s.is_empty()).last())
        }
    };
    format!("{prefix}~{}", code.unwrap_or("error"))
}
