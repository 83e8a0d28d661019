//! Transactional job store.
//!
//! All rows live in one [`Tables`] value behind a mutex. A transaction runs
//! against a copy and replaces the live tables only when the closure returns
//! `Ok`, so every write it made commits together or not at all. When the
//! store is backed by a file, the committed tables are written out before the
//! lock is released. Notifications queued during the transaction go to the
//! store's [`Notifier`] once the lock is released.

pub mod tables;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{DialecticError, Result};
use crate::notify::Notifier;

pub use tables::Tables;

#[derive(Debug)]
pub struct Store {
    tables: Mutex<Tables>,
    snapshot_path: Option<PathBuf>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            snapshot_path: None,
            notifier: None,
        }
    }

    /// Open a store persisted as a JSON snapshot at `path`, creating it on first commit.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tables = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str::<Tables>(&contents)?
        } else {
            Tables::default()
        };
        debug!(path = %path.display(), jobs = tables.jobs.len(), "opened job store");
        Ok(Self {
            tables: Mutex::new(tables),
            snapshot_path: Some(path.to_path_buf()),
            notifier: None,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| DialecticError::Store("job store lock poisoned".into()))
    }

    /// Run `f` as one all-or-nothing transaction.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut live = self.lock()?;
        let mut working = live.clone();
        let out = f(&mut working)?;
        let outbox = std::mem::take(&mut working.outbox);
        if let Some(path) = &self.snapshot_path {
            write_snapshot(path, &working)?;
        }
        *live = working;
        drop(live);

        if let Some(notifier) = &self.notifier {
            for notification in &outbox {
                notifier.notify(notification);
            }
        }
        Ok(out)
    }

    /// Read a consistent view of the tables.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        let live = self.lock()?;
        Ok(f(&live))
    }
}

fn write_snapshot(path: &Path, tables: &Tables) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(tables)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
