//! Durable object storage seen as buckets of keyed blobs.

use crate::error::BlobError;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io,
    path::{Component, Path, PathBuf},
    result,
};
use tokio::fs;

pub type Result<T> = result::Result<T, BlobError>;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// One page of a prefix listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Cursor for the next page; `None` once the listing is exhausted.
    pub next: Option<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage>;

    async fn delete(&self, bucket: &str, keys: &[String]) -> Result<()>;

    /// Download `key` straight into a local file, replacing whatever was there.
    async fn get_to_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = self.get(bucket, key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, &body).await?;
        Ok(())
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = fs::read(path).await?;
        self.put(bucket, key, Bytes::from(body)).await
    }

    /// Every key under `prefix`, following continuation cursors to the end.
    async fn list_by_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation = None;
        loop {
            let page = self.list_page(bucket, prefix, continuation).await?;
            keys.extend(page.keys);
            match page.next {
                Some(next) => continuation = Some(next),
                None => return Ok(keys),
            }
        }
    }

    /// Delete everything under `prefix` one page at a time. Returns how many keys went.
    async fn delete_by_prefix(&self, bucket: &str, prefix: &str) -> Result<usize> {
        let mut deleted = 0;
        let mut continuation = None;
        loop {
            let page = self.list_page(bucket, prefix, continuation).await?;
            if !page.keys.is_empty() {
                self.delete(bucket, &page.keys).await?;
                deleted += page.keys.len();
                tracing::debug!(bucket, prefix, count = page.keys.len(), "deleted page of objects");
            }
            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        tracing::info!(bucket, prefix, deleted, "prefix deleted");
        Ok(deleted)
    }
}

/// Blob store kept in a local directory: `<root>/<bucket>/<key>`.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        validate(bucket)?;
        if bucket.contains('/') {
            return Err(BlobError::InvalidKey(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate(key)?;
        Ok(self.bucket_dir(bucket)?.join(key))
    }

    async fn all_keys(&self, bucket_dir: &Path) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![bucket_dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(bucket_dir) {
                    let key: Vec<_> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn validate(key: &str) -> Result<()> {
    let path = Path::new(key);
    let well_formed = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if well_formed {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(body) => Ok(Bytes::from(body)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &body).await?;
        Ok(())
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let mut matching = self
            .all_keys(&bucket_dir)
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| continuation.as_ref().map_or(true, |after| key > after));

        let keys: Vec<String> = matching.by_ref().take(self.page_size).collect();
        let next = match matching.next() {
            Some(_) => keys.last().cloned(),
            None => None,
        };
        Ok(ListPage { keys, next })
    }

    async fn delete(&self, bucket: &str, keys: &[String]) -> Result<()> {
        let bucket_dir = self.bucket_dir(bucket)?;
        for key in keys {
            let path = self.object_path(bucket, key)?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            // prune directories the delete left empty
            let mut dir = path.parent();
            while let Some(d) = dir {
                if d == bucket_dir || fs::remove_dir(d).await.is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(page_size: usize) -> (tempfile::TempDir, LocalBlobStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(tmp.path()).with_page_size(page_size);
        for i in 0..5 {
            store
                .put("b", &format!("u/1/stems/{}.wav", i), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        store
            .put("b", "u/2/original/song.wav", Bytes::from_static(b"y"))
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn get_put_roundtrip_and_missing() {
        let (_tmp, store) = seeded(10).await;
        assert_eq!(
            store.get("b", "u/2/original/song.wav").await.unwrap(),
            Bytes::from_static(b"y")
        );
        assert!(matches!(
            store.get("b", "nope").await,
            Err(BlobError::NotFound { .. })
        ));
        assert!(matches!(
            store.get("b", "../escape").await,
            Err(BlobError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn listing_follows_cursors() {
        let (_tmp, store) = seeded(2).await;
        let first = store.list_page("b", "u/1/", None).await.unwrap();
        assert_eq!(first.keys.len(), 2);
        assert!(first.next.is_some());

        let keys = store.list_by_prefix("b", "u/1/").await.unwrap();
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], "u/1/stems/0.wav");
    }

    #[tokio::test]
    async fn delete_by_prefix_spans_pages() {
        let (_tmp, store) = seeded(2).await;
        assert_eq!(store.delete_by_prefix("b", "u/1/").await.unwrap(), 5);
        assert!(store.list_by_prefix("b", "u/1/").await.unwrap().is_empty());
        assert_eq!(store.list_by_prefix("b", "u/").await.unwrap().len(), 1);
        assert_eq!(store.delete_by_prefix("b", "u/1/").await.unwrap(), 0);
    }
}
