use std::fs;

use parking_lot::Mutex;

use crate::helpe::*;
use super::{matches_filter, swap_status};

/// On-disk layout: one JSON document holding every block, big integers as
/// hex strings.
#[derive(Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    blocks: Vec<Block>,
}

/// A JSON file shared by any number of processes.
///
/// Readers just read. The document is only ever replaced by an atomic
/// rename, so they always see a complete snapshot. Writers serialise on a
/// [`FileLock`] next to the document and do read-modify-write under it,
/// which makes every compare-and-swap atomic across processes.
pub struct FileStore {
    path:   PathBuf,
    lock:   FileLock,
    policy: LockPolicy,
    // Threads of one process queue here instead of polling the lock file.
    local:  Mutex<()>,
}

impl FileStore {
    /// Opens (or lazily creates) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> PoolResult<Self> {
        let path = path.into();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _   => PathBuf::from("."),
        };
        let name = path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PoolError::InvalidConfig(format!("{} is not a file path", path.display())))?;

        Ok(Self {
            lock:   FileLock::new(dir)?,
            policy: LockPolicy {
                key:            format!("store-{name}"),
                ttl:            Duration::from_secs(10),
                timeout:        Duration::from_secs(5),
                backoff_min:    Duration::from_millis(2),
                backoff_max:    Duration::from_millis(10),
            },
            path,
            local:  Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> PoolResult<StoreDoc> {
        match fs::read(&self.path) {
            Ok(bytes)   => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDoc::default()),
            Err(e)      => Err(e.into()),
        }
    }

    fn commit(&self, doc: &StoreDoc) -> PoolResult<()> {
        let staged = self.path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&staged, serde_json::to_vec_pretty(doc)?)?;
        if let Err(e) = fs::rename(&staged, &self.path) {
            // Best effort; the rename error is what matters.
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }

        Ok(())
    }

    /// Runs `f` over the whole document under the writer lock and commits
    /// the result if `f` asks for it (`Ok((_, true))`).
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Block>) -> PoolResult<(T, bool)>) -> PoolResult<T> {
        let _local = self.local.lock();
        let _guard = LockGuard::acquire(&self.lock, &self.policy).map_err(|e| match e {
            PoolError::LockTimeout { .. } => PoolError::StoreUnavailable(format!(
                "{} is locked by another writer: {e}",
                self.path.display()
            )),
            other   => other,
        })?;
        let mut doc = self.load()?;
        let (res, dirty) = f(&mut doc.blocks)?;
        if dirty {
            self.commit(&doc)?;
        }

        Ok(res)
    }
}

impl BlockStore for FileStore {
    fn list_blocks(&self, filter: &[BlockStatus]) -> PoolResult<Vec<Block>> {
        Ok(self.load()?
            .blocks
            .into_iter()
            .filter(|b| matches_filter(b, filter))
            .collect())
    }

    fn get_block(&self, id: &BlockId) -> PoolResult<Option<Block>> {
        Ok(self.load()?
            .blocks
            .into_iter()
            .find(|b| &b.id == id))
    }

    fn insert_block(&self, block: Block) -> PoolResult<Block> {
        self.mutate(|blocks| {
            if blocks.iter().any(|b| b.id == block.id) {
                return Err(PoolError::StoreUnavailable(format!("block {} already stored", block.id)));
            }
            blocks.push(block.clone());
            Ok((block, true))
        })
    }

    fn update_block_status(
        &self,
        id:         &BlockId,
        expected:   BlockStatus,
        new:        BlockStatus,
        at:         DateTime<Utc>,
    ) -> PoolResult<bool> {
        self.mutate(|blocks| {
            let swapped = blocks
                .iter_mut()
                .find(|b| &b.id == id)
                .is_some_and(|b| swap_status(b, expected, new, at));
            Ok((swapped, swapped))
        })
    }
}
