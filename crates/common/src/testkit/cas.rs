use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::cas::{CasClient, CasError, CasLink, LinkKind, PeerId};
use crate::ledger::ContentKey;

#[derive(Debug, Clone)]
enum Object {
    File(Bytes),
    Directory(Vec<CasLink>),
}

#[derive(Debug, Default)]
struct MockCasInner {
    objects: HashMap<ContentKey, Object>,
    pinned: Vec<ContentKey>,
    pin_calls: usize,
    add_calls: usize,
    unavailable: bool,
    fail_pins: bool,
}

/// In-memory storage node
///
/// Keys are derived from content, so importing the same tree twice yields
/// the same key. Failure modes can be switched on to exercise error paths.
#[derive(Debug, Default)]
pub struct MockCas {
    inner: Mutex<MockCasInner>,
}

fn key_for(parts: &[&[u8]]) -> ContentKey {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    ContentKey::new(format!("mock{}", hex::encode(hasher.finalize())))
}

impl MockCas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a single file, returning its key
    pub fn insert_file(&self, data: &[u8]) -> ContentKey {
        let key = key_for(&[b"file:", data]);
        self.inner
            .lock()
            .objects
            .insert(key.clone(), Object::File(Bytes::copy_from_slice(data)));
        key
    }

    /// Store a flat directory of named files, returning the directory key
    pub fn insert_directory(&self, entries: &[(&str, &[u8])]) -> ContentKey {
        let links: Vec<CasLink> = entries
            .iter()
            .map(|(name, data)| CasLink {
                name: name.to_string(),
                key: self.insert_file(data),
                size: data.len() as u64,
                kind: LinkKind::File,
            })
            .collect();
        self.store_directory(links)
    }

    fn store_directory(&self, mut links: Vec<CasLink>) -> ContentKey {
        links.sort_by(|a, b| a.name.cmp(&b.name));
        let mut parts: Vec<&[u8]> = vec![b"dir:"];
        for link in &links {
            parts.push(link.name.as_bytes());
            parts.push(link.key.as_str().as_bytes());
        }
        let key = key_for(&parts);
        self.inner
            .lock()
            .objects
            .insert(key.clone(), Object::Directory(links));
        key
    }

    fn import(&self, path: &Path) -> Result<(ContentKey, u64, LinkKind), CasError> {
        if path.is_dir() {
            let mut links = Vec::new();
            let mut size = 0;
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                let (key, child_size, kind) = self.import(&entry.path())?;
                size += child_size;
                links.push(CasLink {
                    name: entry.file_name().to_string_lossy().to_string(),
                    key,
                    size: child_size,
                    kind,
                });
            }
            Ok((self.store_directory(links), size, LinkKind::Directory))
        } else {
            let data = std::fs::read(path)?;
            Ok((self.insert_file(&data), data.len() as u64, LinkKind::File))
        }
    }

    /// Make every call fail as if the daemon were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Make pins time out
    pub fn set_fail_pins(&self, fail: bool) {
        self.inner.lock().fail_pins = fail;
    }

    /// Keys successfully pinned, in call order
    pub fn pinned(&self) -> Vec<ContentKey> {
        self.inner.lock().pinned.clone()
    }

    /// Pin attempts, successful or not
    pub fn pin_calls(&self) -> usize {
        self.inner.lock().pin_calls
    }

    pub fn add_calls(&self) -> usize {
        self.inner.lock().add_calls
    }

    fn check_available(&self) -> Result<(), CasError> {
        if self.inner.lock().unavailable {
            return Err(CasError::StorageUnavailable(
                "mock storage switched off".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CasClient for MockCas {
    async fn add(&self, path: &Path) -> Result<ContentKey, CasError> {
        self.check_available()?;
        self.inner.lock().add_calls += 1;
        let (key, _, _) = self.import(path)?;
        Ok(key)
    }

    async fn get(&self, key: &ContentKey, _timeout: Duration) -> Result<Bytes, CasError> {
        self.check_available()?;
        match self.inner.lock().objects.get(key) {
            Some(Object::File(data)) => Ok(data.clone()),
            Some(Object::Directory(_)) => {
                Err(CasError::Malformed(format!("{} is a directory", key)))
            }
            None => Err(CasError::NotFound(key.clone())),
        }
    }

    async fn ls(&self, key: &ContentKey, _timeout: Duration) -> Result<Vec<CasLink>, CasError> {
        self.check_available()?;
        match self.inner.lock().objects.get(key) {
            Some(Object::Directory(links)) => Ok(links.clone()),
            Some(Object::File(_)) => Ok(Vec::new()),
            None => Err(CasError::NotFound(key.clone())),
        }
    }

    async fn pin(
        &self,
        key: &ContentKey,
        _recursive: bool,
        _timeout: Duration,
    ) -> Result<(), CasError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.pin_calls += 1;
        if inner.fail_pins {
            return Err(CasError::PinTimeout(key.clone()));
        }
        if !inner.objects.contains_key(key) {
            return Err(CasError::PinTimeout(key.clone()));
        }
        inner.pinned.push(key.clone());
        Ok(())
    }

    async fn node_id(&self) -> Result<PeerId, CasError> {
        self.check_available()?;
        Ok("mock-storage-node".to_string())
    }
}
