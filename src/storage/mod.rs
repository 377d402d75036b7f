use sha2::{Digest, Sha256};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, Take};

use crate::protocol::payload::{FileId, VersionNumber};

pub const CHUNK_SIZE: usize = 64 * 1024; // 64 KB chunks
const PART_EXTENSION: &str = "part";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("expected {expected} bytes, source ended after {got}")]
    LengthMismatch { expected: u64, got: u64 },

    #[error("reading source failed after {consumed} bytes: {source}")]
    Source { consumed: u64, source: io::Error },

    #[error("writing {key} failed after {consumed} bytes: {source}")]
    Write {
        key: String,
        consumed: u64,
        source: io::Error,
    },

    #[error("object {0} already exists")]
    AlreadyExists(String),

    #[error("object {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Key of a stored version. Built only from server-assigned integers.
pub fn storage_key(file_id: FileId, version: VersionNumber) -> String {
    format!("{}/{}", file_id, version)
}

/// Lowercase hex SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Version-addressed file contents on local disk.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open_root(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        tracing::info!(root = %root.display(), "content store ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Highest file id that has anything under the root, or 0 when none
    /// does. Entries whose names are not ids are ignored.
    pub async fn highest_file_id(&self) -> Result<FileId, StorageError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut highest = 0;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<FileId>().ok()) {
                highest = highest.max(id);
            }
        }
        Ok(highest)
    }

    fn path_for(&self, file_id: FileId, version: VersionNumber) -> PathBuf {
        self.root.join(file_id.to_string()).join(version.to_string())
    }

    /// Stream exactly `declared_len` bytes from `reader` into a provisional
    /// artifact, hashing as it goes. The reader is never read past
    /// `declared_len`. On any error the partial artifact is removed.
    pub async fn save<R>(
        &self,
        file_id: FileId,
        version: VersionNumber,
        reader: &mut R,
        declared_len: u64,
    ) -> Result<StagedObject, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let key = storage_key(file_id, version);
        let final_path = self.path_for(file_id, version);
        let part_path = final_path.with_extension(PART_EXTENSION);

        let mut file = match create_part(&part_path).await {
            Ok(file) => file,
            Err(source) => {
                return Err(StorageError::Write {
                    key,
                    consumed: 0,
                    source,
                })
            }
        };

        match copy_hashed(reader, &mut file, declared_len, &key).await {
            Ok(sha256) => Ok(StagedObject {
                key,
                part_path,
                final_path,
                sha256,
                size: declared_len,
            }),
            Err(e) => {
                drop(file);
                remove_quietly(&part_path).await;
                Err(e)
            }
        }
    }

    /// Open a committed version for reading, limited to `len` bytes.
    pub async fn open(
        &self,
        file_id: FileId,
        version: VersionNumber,
        len: u64,
    ) -> Result<Take<File>, StorageError> {
        let key = storage_key(file_id, version);
        let file = match File::open(self.path_for(file_id, version)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound(key)),
            Err(e) => return Err(e.into()),
        };

        let on_disk = file.metadata().await?.len();
        if on_disk < len {
            return Err(StorageError::LengthMismatch {
                expected: len,
                got: on_disk,
            });
        }
        Ok(file.take(len))
    }

    /// Remove a committed version. Returns `false` if it was not there.
    pub async fn delete(&self, file_id: FileId, version: VersionNumber) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_for(file_id, version)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// A fully written but not yet verified artifact.
#[derive(Debug)]
#[must_use = "a staged object must be committed or discarded"]
pub struct StagedObject {
    key: String,
    part_path: PathBuf,
    final_path: PathBuf,
    sha256: String,
    size: u64,
}

impl StagedObject {
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Move the artifact to its final key. Never overwrites a committed version.
    pub async fn commit(self) -> Result<String, StorageError> {
        // hard_link fails if the target exists, which keeps versions immutable
        match fs::hard_link(&self.part_path, &self.final_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                remove_quietly(&self.part_path).await;
                return Err(StorageError::AlreadyExists(self.key));
            }
            Err(e) => {
                remove_quietly(&self.part_path).await;
                return Err(e.into());
            }
        }
        remove_quietly(&self.part_path).await;
        Ok(self.key)
    }

    pub async fn discard(self) {
        remove_quietly(&self.part_path).await;
    }
}

async fn create_part(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    File::create(path).await
}

async fn copy_hashed<R>(
    reader: &mut R,
    file: &mut File,
    declared_len: u64,
    key: &str,
) -> Result<String, StorageError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut consumed = 0u64;

    while consumed < declared_len {
        let want = (declared_len - consumed).min(CHUNK_SIZE as u64) as usize;
        let n = match reader.read(&mut buffer[..want]).await {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => return Err(StorageError::Source { consumed, source }),
        };
        if n == 0 {
            return Err(StorageError::LengthMismatch {
                expected: declared_len,
                got: consumed,
            });
        }
        consumed += n as u64;
        hasher.update(&buffer[..n]);

        if let Err(source) = file.write_all(&buffer[..n]).await {
            return Err(StorageError::Write {
                key: key.to_string(),
                consumed,
                source,
            });
        }
    }

    let synced = match file.flush().await {
        Ok(()) => file.sync_all().await,
        Err(e) => Err(e),
    };
    if let Err(source) = synced {
        return Err(StorageError::Write {
            key: key.to_string(),
            consumed,
            source,
        });
    }

    Ok(hex::encode(hasher.finalize()))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn read_back(store: &ContentStore, file_id: FileId, version: VersionNumber, len: u64) -> Vec<u8> {
        let mut reader = store.open(file_id, version, len).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_save_commit_read() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open_root(dir.path()).await.unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();

        let mut source = &data[..];
        let staged = store.save(3, 1, &mut source, data.len() as u64).await.unwrap();
        assert_eq!(staged.sha256(), checksum(&data));
        assert_eq!(staged.size(), data.len() as u64);
        assert_eq!(staged.key(), "3/1");

        let key = staged.commit().await.unwrap();
        assert_eq!(key, "3/1");
        assert_eq!(read_back(&store, 3, 1, data.len() as u64).await, data);
        assert!(!dir.path().join("3").join("1.part").exists());
    }

    #[tokio::test]
    async fn test_save_never_reads_past_declared_length() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open_root(dir.path()).await.unwrap();

        let wire = b"0123456789{\"operation\":\"PING\"}";
        let mut source = &wire[..];
        let staged = store.save(1, 1, &mut source, 10).await.unwrap();
        assert_eq!(staged.sha256(), checksum(b"0123456789"));
        assert_eq!(source, b"{\"operation\":\"PING\"}");
        staged.discard().await;
    }

    #[tokio::test]
    async fn test_short_source_removes_partial_artifact() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open_root(dir.path()).await.unwrap();

        let mut source = &b"short"[..];
        match store.save(9, 2, &mut source, 10).await {
            Err(StorageError::LengthMismatch { expected, got }) => {
                assert_eq!(expected, 10);
                assert_eq!(got, 5);
            }
            other => panic!("expected LengthMismatch, got {:?}", other),
        }
        assert!(!dir.path().join("9").join("2.part").exists());
        assert!(!dir.path().join("9").join("2").exists());
    }

    #[tokio::test]
    async fn test_discard_leaves_nothing() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open_root(dir.path()).await.unwrap();

        let mut source = &b"abc"[..];
        let staged = store.save(4, 1, &mut source, 3).await.unwrap();
        staged.discard().await;

        assert!(matches!(store.open(4, 1, 3).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_commit_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open_root(dir.path()).await.unwrap();

        let mut first = &b"first"[..];
        store.save(5, 1, &mut first, 5).await.unwrap().commit().await.unwrap();

        let mut second = &b"other"[..];
        let staged = store.save(5, 1, &mut second, 5).await.unwrap();
        assert!(matches!(staged.commit().await, Err(StorageError::AlreadyExists(_))));
        assert_eq!(read_back(&store, 5, 1, 5).await, b"first");
    }

    #[tokio::test]
    async fn test_open_limits_to_recorded_length() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open_root(dir.path()).await.unwrap();

        let mut source = &b"abcdef"[..];
        store.save(6, 1, &mut source, 6).await.unwrap().commit().await.unwrap();

        assert_eq!(read_back(&store, 6, 1, 4).await, b"abcd");
        assert!(matches!(
            store.open(6, 1, 10).await,
            Err(StorageError::LengthMismatch { expected: 10, got: 6 })
        ));
    }

    #[tokio::test]
    async fn test_highest_file_id() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open_root(dir.path()).await.unwrap();
        assert_eq!(store.highest_file_id().await.unwrap(), 0);

        for id in [3, 12, 7] {
            let mut source = &b"x"[..];
            store.save(id, 1, &mut source, 1).await.unwrap().commit().await.unwrap();
        }
        std::fs::create_dir(dir.path().join("lost+found")).unwrap();
        assert_eq!(store.highest_file_id().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open_root(dir.path()).await.unwrap();

        let mut source = &b"x"[..];
        store.save(7, 1, &mut source, 1).await.unwrap().commit().await.unwrap();
        assert!(store.delete(7, 1).await.unwrap());
        assert!(!store.delete(7, 1).await.unwrap());
    }
}
