//! Content-addressed storage client
//!
//! Everything the pipeline knows about stored content goes through a
//! [`CasClient`]. The daemon talks to a Kubo-compatible node over HTTP;
//! tests swap in an in-memory double.

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::ledger::ContentKey;

mod http;

pub use http::HttpCasClient;

/// Identity the storage node reports for itself
pub type PeerId = String;

#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// The storage daemon could not be reached at all
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("content not found: {0}")]
    NotFound(ContentKey),
    #[error("timed out pinning {0}")]
    PinTimeout(ContentKey),
    /// The daemon answered with something we could not make sense of
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("HTTP status {0}: {1}")]
    Http(StatusCode, String),
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    File,
    Directory,
    Other,
}

/// One child of a stored directory, as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasLink {
    pub name: String,
    pub key: ContentKey,
    pub size: u64,
    pub kind: LinkKind,
}

#[async_trait]
pub trait CasClient: Send + Sync + Debug + 'static {
    /// Import a file or directory tree, returning the root content key
    async fn add(&self, path: &Path) -> Result<ContentKey, CasError>;

    /// Fetch the full bytes behind a key
    async fn get(&self, key: &ContentKey, timeout: Duration) -> Result<Bytes, CasError>;

    /// List a key's immediate children without fetching their data
    async fn ls(&self, key: &ContentKey, timeout: Duration) -> Result<Vec<CasLink>, CasError>;

    /// Ask the storage node to retain the content behind a key
    ///
    /// # Arguments
    /// * `recursive` - Also retain everything the key links to
    /// * `timeout` - Give up (with [`CasError::PinTimeout`]) after this long
    async fn pin(&self, key: &ContentKey, recursive: bool, timeout: Duration)
        -> Result<(), CasError>;

    async fn node_id(&self) -> Result<PeerId, CasError>;
}
