//! Atomic JSON file persistence shared by the stores
//!
//! The file is the source of truth. Several worker processes may share one
//! data directory, so every mutation runs read-modify-write under an
//! exclusive `flock` on a sidecar `.lock` file: read the current file, apply
//! the change to that copy, write it, and only then replace the in-memory
//! map. A failed write leaves memory as it was.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Distinguishes temp files of concurrent writers inside one process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A JSON map on disk with an in-memory copy.
pub(crate) struct FileMap<T> {
    path: PathBuf,
    state: Mutex<HashMap<String, T>>,
}

impl<T> FileMap<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    /// Load the map from `path`, creating the file as `{}` on cold start.
    pub(crate) async fn load(path: PathBuf) -> Result<Self> {
        let _lock = StoreLock::acquire(&path).await?;
        let map = match read_map(&path).await? {
            Some(map) => {
                info!(path = %path.display(), entries = map.len(), "loaded store");
                map
            }
            None => {
                info!(path = %path.display(), "store file not found, starting empty");
                let map = HashMap::new();
                write_atomic(&path, &map).await?;
                map
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(map),
        })
    }

    pub(crate) async fn get(&self, key: &str) -> Option<T> {
        self.state.lock().await.get(key).cloned()
    }

    /// Run `f` over the in-memory map.
    pub(crate) async fn read<R>(&self, f: impl FnOnce(&HashMap<String, T>) -> R) -> R {
        f(&*self.state.lock().await)
    }

    /// Replace memory with the file's current contents.
    pub(crate) async fn sync(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(map) = read_map(&self.path).await? {
            *state = map;
        }
        Ok(())
    }

    /// Re-read one entry from disk, updating memory with what was found.
    pub(crate) async fn reload(&self, key: &str) -> Result<Option<T>> {
        self.sync().await?;
        Ok(self.get(key).await)
    }

    /// Read-modify-write under the cross-process lock. `f` works on a fresh
    /// copy of the file; memory is replaced only after the write succeeds.
    pub(crate) async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, T>) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().await;
        let _lock = StoreLock::acquire(&self.path).await?;
        let mut map = read_map(&self.path).await?.unwrap_or_default();
        let out = f(&mut map)?;
        write_atomic(&self.path, &map).await?;
        *state = map;
        Ok(out)
    }
}

/// Read the JSON map at `path`. `Ok(None)` when the file does not exist.
async fn read_map<T: DeserializeOwned>(path: &Path) -> Result<Option<HashMap<String, T>>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading {}: {e}", path.display()))),
    };
    let map = serde_json::from_str(&contents)
        .map_err(|e| Error::Parse(format!("parsing {}: {e}", path.display())))?;
    Ok(Some(map))
}

/// Write a map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The file holds OAuth tokens, so permissions are 0600.
async fn write_atomic<T: Serialize>(path: &Path, data: &HashMap<String, T>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing {}: {e}", path.display())))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");
    let tmp_path = dir.join(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Io(format!("renaming temp store file: {e}")));
    }

    debug!(path = %path.display(), "persisted store");
    Ok(())
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive `flock` on `<store>.lock`, released on drop.
///
/// Only unix gets a cross-process lock; elsewhere writers are serialized
/// within one process only.
struct StoreLock {
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<std::fs::File>,
}

impl StoreLock {
    #[cfg(unix)]
    async fn acquire(path: &Path) -> Result<Self> {
        use nix::fcntl::{Flock, FlockArg};

        let lock_path = lock_path(path);
        let flock = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .map_err(|e| Error::Io(format!("opening {}: {e}", lock_path.display())))?;
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_file, errno)| {
                Error::Io(format!("locking {}: {errno}", lock_path.display()))
            })
        })
        .await
        .map_err(|e| Error::Io(format!("store lock task failed: {e}")))??;
        Ok(Self { _flock: flock })
    }

    #[cfg(not(unix))]
    async fn acquire(_path: &Path) -> Result<Self> {
        Ok(Self {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn map(dir: &Path) -> FileMap<u32> {
        FileMap::load(dir.join("counts.json")).await.unwrap()
    }

    #[test]
    fn lock_file_sits_next_to_store() {
        assert_eq!(
            lock_path(Path::new("/data/tokens.json")),
            PathBuf::from("/data/tokens.json.lock")
        );
    }

    #[tokio::test]
    async fn two_handles_on_one_file_do_not_lose_writes() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(map(dir.path()).await);
        let b = Arc::new(map(dir.path()).await);

        let mut handles = vec![];
        for i in 0..20 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(tokio::spawn(async move {
                store
                    .mutate(|m| {
                        *m.entry("n".into()).or_insert(0) += 1;
                        Ok(())
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(a.reload("n").await.unwrap(), Some(20));
        assert_eq!(b.reload("n").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn mutation_sees_other_handles_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = map(dir.path()).await;
        let b = map(dir.path()).await;

        a.mutate(|m| Ok(m.insert("x".into(), 1))).await.unwrap();
        b.mutate(|m| Ok(m.insert("y".into(), 2))).await.unwrap();

        // b's write kept a's entry, and b's memory picked it up
        assert_eq!(b.get("x").await, Some(1));
        assert_eq!(a.reload("y").await.unwrap(), Some(2));
        assert_eq!(a.get("x").await, Some(1));
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.json");
        let store = FileMap::<u32>::load(path.clone()).await.unwrap();
        store.mutate(|m| Ok(m.insert("n".into(), 1))).await.unwrap();

        tokio::fs::remove_file(&path).await.unwrap();
        tokio::fs::create_dir(&path).await.unwrap();

        let result = store.mutate(|m| Ok(m.insert("n".into(), 2))).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(store.get("n").await, Some(1));
    }

    #[tokio::test]
    async fn closure_error_skips_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = map(dir.path()).await;

        let result: Result<()> = store
            .mutate(|m| {
                m.insert("n".into(), 9);
                Err(Error::NotFound("n".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.reload("n").await.unwrap(), None);
    }
}
