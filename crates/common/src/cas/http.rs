use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use url::Url;
use walkdir::WalkDir;

use super::{CasClient, CasError, CasLink, LinkKind, PeerId};
use crate::ledger::ContentKey;

const DIRECTORY_MIME: &str = "application/x-directory";
const FILE_MIME: &str = "application/octet-stream";

// unixfs node types as reported by `ls`
const UNIXFS_DIRECTORY: i32 = 1;
const UNIXFS_FILE: i32 = 2;

/// Client for a Kubo-compatible HTTP RPC endpoint
///
/// Every call is a `POST` to `<api_url>/api/v0/<command>`. No call is
/// retried here; callers decide what a failure means for them.
#[derive(Debug, Clone)]
pub struct HttpCasClient {
    pub api_url: Url,
    client: Client,
}

#[derive(Deserialize)]
struct AddLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct LsResponse {
    #[serde(rename = "Objects", default)]
    objects: Vec<LsObject>,
}

#[derive(Deserialize)]
struct LsObject {
    #[serde(rename = "Links", default)]
    links: Vec<LsLink>,
}

#[derive(Deserialize)]
struct LsLink {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Size", default)]
    size: u64,
    #[serde(rename = "Type", default)]
    kind: i32,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct RpcError {
    #[serde(rename = "Message")]
    message: String,
}

impl HttpCasClient {
    pub fn new(api_url: &Url) -> Result<Self, CasError> {
        let client = Client::builder().build()?;
        Ok(Self {
            api_url: api_url.clone(),
            client,
        })
    }

    fn endpoint(&self, command: &str) -> Result<Url, CasError> {
        Ok(self.api_url.join(&format!("api/v0/{}", command))?)
    }

    /// Build the multipart body Kubo expects for a directory import
    ///
    /// Each part is named by its path relative to the import root's
    /// parent, percent-encoded, with directories sent as empty
    /// `application/x-directory` parts ahead of their contents.
    async fn directory_form(&self, root: &Path) -> Result<Form, CasError> {
        let base = root.parent().unwrap_or(root);
        let mut form = Form::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(base)
                .map_err(|e| CasError::Malformed(e.to_string()))?;
            let name: String =
                url::form_urlencoded::byte_serialize(relative.to_string_lossy().as_bytes())
                    .collect();

            let part = if entry.file_type().is_dir() {
                Part::bytes(Vec::new())
                    .file_name(name)
                    .mime_str(DIRECTORY_MIME)?
            } else {
                let data = tokio::fs::read(entry.path()).await?;
                Part::bytes(data).file_name(name).mime_str(FILE_MIME)?
            };
            form = form.part("file", part);
        }
        Ok(form)
    }

    /// Turn a non-success response into a typed error
    async fn rpc_error(response: Response, key: Option<&ContentKey>) -> CasError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<RpcError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);

        let lowered = message.to_lowercase();
        match key {
            Some(key)
                if status == StatusCode::INTERNAL_SERVER_ERROR
                    && (lowered.contains("not found") || lowered.contains("no link named")) =>
            {
                CasError::NotFound(key.clone())
            }
            _ => CasError::Http(status, message),
        }
    }
}

/// Map transport-level failures onto the storage error taxonomy
fn classify(e: reqwest::Error, on_timeout: impl FnOnce() -> CasError) -> CasError {
    if e.is_timeout() {
        on_timeout()
    } else if e.is_connect() {
        CasError::StorageUnavailable(e.to_string())
    } else if e.is_decode() {
        CasError::Malformed(e.to_string())
    } else {
        CasError::Reqwest(e)
    }
}

#[async_trait]
impl CasClient for HttpCasClient {
    async fn add(&self, path: &Path) -> Result<ContentKey, CasError> {
        let mut url = self.endpoint("add")?;
        url.query_pairs_mut()
            .append_pair("recursive", "true")
            .append_pair("wrap-with-directory", "false")
            .append_pair("pin", "false")
            .append_pair("progress", "false");

        let form = if path.is_dir() {
            self.directory_form(path).await?
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let data = tokio::fs::read(path).await?;
            Form::new().part("file", Part::bytes(data).file_name(name).mime_str(FILE_MIME)?)
        };

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify(e, || CasError::StorageUnavailable("add timed out".into())))?;
        if !response.status().is_success() {
            return Err(Self::rpc_error(response, None).await);
        }
        let body = response.text().await?;

        // NDJSON, one line per imported node; the root comes last
        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut last = None;
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: AddLine = serde_json::from_str(line)
                .map_err(|e| CasError::Malformed(format!("add response: {}", e)))?;
            let is_root = parsed.name == root_name;
            last = Some(parsed);
            if is_root {
                break;
            }
        }

        let root = last.ok_or_else(|| CasError::Malformed("add returned no entries".into()))?;
        tracing::debug!(path = %path.display(), key = %root.hash, "imported into storage");
        Ok(ContentKey::new(root.hash))
    }

    async fn get(&self, key: &ContentKey, timeout: Duration) -> Result<Bytes, CasError> {
        let mut url = self.endpoint("cat")?;
        url.query_pairs_mut().append_pair("arg", key.as_str());

        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, || CasError::NotFound(key.clone())))?;
        if !response.status().is_success() {
            return Err(Self::rpc_error(response, Some(key)).await);
        }
        response
            .bytes()
            .await
            .map_err(|e| classify(e, || CasError::NotFound(key.clone())))
    }

    async fn ls(&self, key: &ContentKey, timeout: Duration) -> Result<Vec<CasLink>, CasError> {
        let mut url = self.endpoint("ls")?;
        url.query_pairs_mut()
            .append_pair("arg", key.as_str())
            .append_pair("resolve-type", "true")
            .append_pair("size", "true");

        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, || CasError::NotFound(key.clone())))?;
        if !response.status().is_success() {
            return Err(Self::rpc_error(response, Some(key)).await);
        }
        let listing: LsResponse = response
            .json()
            .await
            .map_err(|e| classify(e, || CasError::NotFound(key.clone())))?;

        Ok(listing
            .objects
            .into_iter()
            .flat_map(|object| object.links)
            .map(|link| CasLink {
                name: link.name,
                key: ContentKey::new(link.hash),
                size: link.size,
                kind: match link.kind {
                    UNIXFS_DIRECTORY => LinkKind::Directory,
                    UNIXFS_FILE => LinkKind::File,
                    _ => LinkKind::Other,
                },
            })
            .collect())
    }

    async fn pin(
        &self,
        key: &ContentKey,
        recursive: bool,
        timeout: Duration,
    ) -> Result<(), CasError> {
        let mut url = self.endpoint("pin/add")?;
        url.query_pairs_mut()
            .append_pair("arg", key.as_str())
            .append_pair("recursive", if recursive { "true" } else { "false" });

        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, || CasError::PinTimeout(key.clone())))?;
        if !response.status().is_success() {
            return Err(Self::rpc_error(response, Some(key)).await);
        }
        // drain the body so a slow pin is still bounded by the timeout
        response
            .bytes()
            .await
            .map_err(|e| classify(e, || CasError::PinTimeout(key.clone())))?;
        Ok(())
    }

    async fn node_id(&self) -> Result<PeerId, CasError> {
        let url = self.endpoint("id")?;
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| classify(e, || CasError::StorageUnavailable("id timed out".into())))?;
        if !response.status().is_success() {
            return Err(Self::rpc_error(response, None).await);
        }
        let id: IdResponse = response
            .json()
            .await
            .map_err(|e| classify(e, || CasError::StorageUnavailable("id timed out".into())))?;
        Ok(id.id)
    }
}
