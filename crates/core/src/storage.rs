//! Durable placement of uploaded files.
//!
//! Uploads land under the uploads root with a generated, time-derived name.
//! The detection worker writes its result under the detected root with the
//! same name, so an asset and its detection output always correspond 1:1.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const MAX_EXTENSION_LEN: usize = 16;
const MAX_CREATE_ATTEMPTS: usize = 64;
const COPY_BUFFER_BYTES: usize = 64 * 1024;

/// Last timestamp handed out as a file stem. Names are strictly increasing
/// within the process, so two uploads in the same millisecond never collide.
static LAST_ISSUED_MILLIS: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to prepare directory {}: {source}", path.display())]
    Directory { path: PathBuf, source: io::Error },
    #[error("failed to create {}: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("could not find a free file name in {} after {attempts} attempts", dir.display())]
    NameExhausted { dir: PathBuf, attempts: usize },
}

/// A file accepted into the uploads root. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedAsset {
    pub generated_name: String,
    pub storage_path: PathBuf,
    pub original_name: String,
}

#[derive(Debug, Clone)]
pub struct Storage {
    uploads_dir: PathBuf,
    detected_dir: PathBuf,
}

impl Storage {
    /// Create both roots if absent and resolve them to absolute paths.
    /// Safe to call repeatedly.
    pub async fn open(uploads_dir: &Path, detected_dir: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            uploads_dir: ensure_dir(uploads_dir).await?,
            detected_dir: ensure_dir(detected_dir).await?,
        })
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn detected_dir(&self) -> &Path {
        &self.detected_dir
    }

    /// Where the detection output for `asset` is expected.
    pub fn detected_path(&self, asset: &UploadedAsset) -> PathBuf {
        self.detected_dir.join(&asset.generated_name)
    }

    /// Reserve a fresh name and open it for writing.
    pub async fn begin(&self, original_name: &str) -> Result<UploadWriter, StorageError> {
        let extension = sanitized_extension(original_name);

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let generated_name = format!("{}{extension}", next_name_stem());
            let path = self.uploads_dir.join(&generated_name);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    return Ok(UploadWriter {
                        file: Some(file),
                        asset: UploadedAsset {
                            generated_name,
                            storage_path: path,
                            original_name: original_name.to_string(),
                        },
                        bytes_written: 0,
                        committed: false,
                    });
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "Generated name already on disk, retrying");
                }
                Err(source) => return Err(StorageError::Create { path, source }),
            }
        }

        Err(StorageError::NameExhausted {
            dir: self.uploads_dir.clone(),
            attempts: MAX_CREATE_ATTEMPTS,
        })
    }

    /// Copy `reader` to completion into a newly named upload.
    pub async fn store<R>(&self, mut reader: R, original_name: &str) -> Result<UploadedAsset, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut writer = self.begin(original_name).await?;
        let mut buf = vec![0u8; COPY_BUFFER_BYTES];
        loop {
            let read = reader
                .read(&mut buf)
                .await
                .map_err(|source| StorageError::Write {
                    path: writer.asset.storage_path.clone(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            writer.write_chunk(&buf[..read]).await?;
        }
        writer.commit().await
    }

    /// Remove an asset and any detection output written for it.
    pub async fn discard(&self, asset: &UploadedAsset) {
        for path in [asset.storage_path.clone(), self.detected_path(asset)] {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed file"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => warn!(path = %path.display(), error = %error, "Failed to remove file"),
            }
        }
    }
}

/// An upload being streamed to disk. Dropping it before [`commit`] removes
/// the partial file.
///
/// [`commit`]: UploadWriter::commit
#[derive(Debug)]
pub struct UploadWriter {
    file: Option<File>,
    asset: UploadedAsset,
    bytes_written: u64,
    committed: bool,
}

impl UploadWriter {
    pub fn asset(&self) -> &UploadedAsset {
        &self.asset
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.write_all(chunk)
            .await
            .map_err(|source| StorageError::Write {
                path: self.asset.storage_path.clone(),
                source,
            })?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Flush to durable storage and hand back the finished asset.
    pub async fn commit(mut self) -> Result<UploadedAsset, StorageError> {
        if let Some(mut file) = self.file.take() {
            let path = self.asset.storage_path.clone();
            file.flush()
                .await
                .map_err(|source| StorageError::Write {
                    path: path.clone(),
                    source,
                })?;
            file.sync_all()
                .await
                .map_err(|source| StorageError::Write { path, source })?;
        }
        self.committed = true;
        debug!(
            filename = %self.asset.generated_name,
            bytes = self.bytes_written,
            "Upload stored"
        );
        Ok(self.asset.clone())
    }
}

impl Drop for UploadWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.file.take();
        if let Err(error) = std::fs::remove_file(&self.asset.storage_path) {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(
                    path = %self.asset.storage_path.display(),
                    error = %error,
                    "Failed to remove partial upload"
                );
            }
        }
    }
}

async fn ensure_dir(path: &Path) -> Result<PathBuf, StorageError> {
    let to_err = |source| StorageError::Directory {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(path).await.map_err(to_err)?;
    fs::canonicalize(path).await.map_err(to_err)
}

fn next_name_stem() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_ISSUED_MILLIS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_ISSUED_MILLIS.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// `.ext` from the client-supplied name, restricted to ASCII alphanumerics.
/// Anything else yields no extension.
fn sanitized_extension(original_name: &str) -> String {
    let file_name = original_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    match Path::new(file_name).extension().and_then(|ext| ext.to_str()) {
        Some(ext)
            if !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|ch| ch.is_ascii_alphanumeric()) =>
        {
            format!(".{ext}")
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use tempfile::tempdir;

    async fn test_storage(root: &Path) -> Storage {
        Storage::open(&root.join("uploads"), &root.join("detected"))
            .await
            .expect("open storage")
    }

    #[test]
    fn sanitized_extension_keeps_plain_extensions() {
        assert_eq!(sanitized_extension("photo.JPG"), ".JPG");
        assert_eq!(sanitized_extension("archive.tar.gz"), ".gz");
        assert_eq!(sanitized_extension("C:\\Users\\me\\pano.jpeg"), ".jpeg");
    }

    #[test]
    fn sanitized_extension_drops_suspicious_input() {
        assert_eq!(sanitized_extension("noext"), "");
        assert_eq!(sanitized_extension(".hidden"), "");
        assert_eq!(sanitized_extension("x.j/pg"), "");
        assert_eq!(sanitized_extension("x.a b"), "");
        assert_eq!(sanitized_extension("x.abcdefghijklmnopq"), "");
    }

    #[test]
    fn name_stems_strictly_increase() {
        let first = next_name_stem();
        let second = next_name_stem();
        let third = next_name_stem();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn open_is_idempotent_and_absolute() {
        let temp = tempdir().expect("tempdir");
        let first = test_storage(temp.path()).await;
        let second = test_storage(temp.path()).await;

        assert!(first.uploads_dir().is_absolute());
        assert!(first.detected_dir().is_absolute());
        assert_eq!(first.uploads_dir(), second.uploads_dir());
        assert!(first.uploads_dir().is_dir());
        assert!(first.detected_dir().is_dir());
    }

    #[tokio::test]
    async fn open_fails_when_root_is_a_file() {
        let temp = tempdir().expect("tempdir");
        let blocker = temp.path().join("uploads");
        std::fs::write(&blocker, b"not a dir").expect("write blocker");

        let err = Storage::open(&blocker, &temp.path().join("detected"))
            .await
            .expect_err("file in place of directory must fail");
        assert!(matches!(err, StorageError::Directory { .. }));
    }

    #[tokio::test]
    async fn store_writes_all_bytes_and_keeps_extension() {
        let temp = tempdir().expect("tempdir");
        let storage = test_storage(temp.path()).await;
        let payload = vec![7u8; COPY_BUFFER_BYTES * 2 + 13];

        let asset = storage
            .store(payload.as_slice(), "pano.jpg")
            .await
            .expect("store upload");

        assert!(asset.generated_name.ends_with(".jpg"));
        assert_eq!(asset.original_name, "pano.jpg");
        assert_eq!(asset.storage_path, storage.uploads_dir().join(&asset.generated_name));
        assert_eq!(std::fs::read(&asset.storage_path).expect("read back"), payload);
        assert_eq!(
            storage.detected_path(&asset),
            storage.detected_dir().join(&asset.generated_name)
        );
    }

    #[tokio::test]
    async fn concurrent_stores_never_share_a_name() {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(test_storage(temp.path()).await);

        let mut handles = Vec::new();
        for i in 0..32 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let body = format!("upload {i}");
                storage
                    .store(body.as_bytes(), "same.jpg")
                    .await
                    .expect("store upload")
            }));
        }

        let mut names = HashSet::new();
        for handle in handles {
            let asset = handle.await.expect("join store task");
            assert!(names.insert(asset.generated_name));
        }
        assert_eq!(names.len(), 32);
        assert_eq!(std::fs::read_dir(storage.uploads_dir()).unwrap().count(), 32);
    }

    #[tokio::test]
    async fn dropped_writer_removes_partial_file() {
        let temp = tempdir().expect("tempdir");
        let storage = test_storage(temp.path()).await;

        let mut writer = storage.begin("partial.png").await.expect("begin upload");
        writer.write_chunk(b"half an image").await.expect("write chunk");
        let path = writer.asset().storage_path.clone();
        assert!(path.exists());

        drop(writer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn discard_removes_upload_and_detection_output() {
        let temp = tempdir().expect("tempdir");
        let storage = test_storage(temp.path()).await;
        let asset = storage.store(&b"bytes"[..], "a.jpg").await.expect("store");
        std::fs::write(storage.detected_path(&asset), b"result").expect("write output");

        storage.discard(&asset).await;

        assert!(!asset.storage_path.exists());
        assert!(!storage.detected_path(&asset).exists());
        storage.discard(&asset).await;
    }
}
