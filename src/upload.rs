//! Upload of the finished bundle to a remote collector.
//!
//! The collector takes a multipart POST with a `file` part, a `hostname`
//! field and a bearer token. A 200 response may carry a JSON body with the
//! checksum the collector computed.

use std::error::Error as _;
use std::path::{Path, PathBuf};

use reqwest::blocking::multipart::Form;
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::config::UploadConfig;
use crate::error::{NetworkErrorKind, UploadError};

/// Response bodies longer than this are truncated in error messages.
const MAX_BODY_CHARS: usize = 512;

/// A successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub bundle: PathBuf,
    pub checksum: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UploadResponse {
    checksum: Option<String>,
    sha256: Option<String>,
}

/// Transfers a bundle somewhere.
pub trait Uploader: Send + Sync {
    fn upload(&self, bundle: &Path, config: &UploadConfig) -> Result<UploadReceipt, UploadError>;
}

/// Multipart HTTP uploader.
pub struct HttpUploader {
    hostname: String,
}

impl HttpUploader {
    pub fn new(hostname: impl Into<String>) -> Self {
        HttpUploader {
            hostname: hostname.into(),
        }
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, bundle: &Path, config: &UploadConfig) -> Result<UploadReceipt, UploadError> {
        if !bundle.is_file() {
            return Err(UploadError::MissingFile(bundle.to_path_buf()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(classify_transport)?;
        let form = Form::new()
            .text("hostname", self.hostname.clone())
            .file("file", bundle)
            .map_err(|_| UploadError::MissingFile(bundle.to_path_buf()))?;

        let mut request = client.post(&config.endpoint).multipart(form);
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        tracing::info!("Uploading {} to {}...", bundle.display(), config.endpoint);
        let response = request.send().map_err(classify_transport)?;
        let code = response.status().as_u16();
        let body = response.text().map_err(classify_transport)?;

        classify_response(code, &body).map(|checksum| UploadReceipt {
            bundle: bundle.to_path_buf(),
            checksum,
        })
    }
}

/// Map an HTTP status and body to an upload outcome. On success returns the
/// checksum from the body, if any.
pub fn classify_response(code: u16, body: &str) -> Result<Option<String>, UploadError> {
    match code {
        200 => Ok(extract_checksum(body)),
        400 => Err(UploadError::BadRequest {
            body: truncate(body),
        }),
        403 => Err(UploadError::Auth),
        413 => Err(UploadError::TooLarge),
        500..=599 => Err(UploadError::Server { code }),
        _ => Err(UploadError::Unexpected {
            code,
            body: truncate(body),
        }),
    }
}

fn extract_checksum(body: &str) -> Option<String> {
    let response: UploadResponse = serde_json::from_str(body).ok()?;
    response.checksum.or(response.sha256)
}

/// Classify a transport-level failure.
pub fn classify_transport(err: reqwest::Error) -> UploadError {
    let kind = if is_dns_error(&err) {
        NetworkErrorKind::Dns
    } else if err.is_timeout() {
        NetworkErrorKind::Timeout
    } else if err.is_connect() {
        NetworkErrorKind::Connect
    } else {
        NetworkErrorKind::Other
    };

    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    UploadError::Network { kind, detail }
}

fn is_dns_error(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = cause.source();
    }
    false
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
