use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::fs_utils::remove_dir_all_if_exists;

const REMOVE_ATTEMPTS: u32 = 8;
const REMOVE_BASE_DELAY: Duration = Duration::from_millis(10);

/// Shared handle to the one workspace directory of a run.
///
/// The signal handler and the pipeline hold clones of the same slot; whichever
/// calls [`CleanupSlot::release`] first removes the directory, later calls are
/// no-ops.
#[derive(Debug, Clone, Default)]
pub struct CleanupSlot {
    inner: Arc<Mutex<Option<TempDir>>>,
}

impl CleanupSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<TempDir>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn hold(&self, dir: TempDir) -> Result<()> {
        let mut guard = self.lock();
        if let Some(existing) = guard.as_ref() {
            return Err(anyhow!(
                "workspace slot already holds {}",
                existing.path().display()
            ));
        }
        *guard = Some(dir);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn held_path(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|dir| dir.path().to_path_buf())
    }

    /// Removes the held directory. Returns `false` when nothing was held.
    ///
    /// A subprocess hit by the same signal may still be writing into the
    /// directory, so removal is retried with backoff. If every attempt fails
    /// the directory stays in the slot and a later call tries again.
    pub fn release(&self) -> Result<bool> {
        let mut guard = self.lock();
        let Some(dir) = guard.as_ref() else {
            return Ok(false);
        };
        let path = dir.path().to_path_buf();
        remove_with_retry(&path)?;
        guard.take();
        debug!(path = %path.display(), "workspace removed");
        Ok(true)
    }
}

fn remove_with_retry(path: &Path) -> Result<()> {
    let mut delay = REMOVE_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match remove_dir_all_if_exists(path) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= REMOVE_ATTEMPTS => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to remove workspace {} after {attempt} attempts",
                        path.display()
                    )
                });
            }
            Err(err) => {
                debug!(
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "workspace removal failed, retrying"
                );
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// Exclusive scratch directory for fetch, extraction and patching.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    slot: CleanupSlot,
}

impl Workspace {
    /// Creates the directory and registers it with `slot` before returning, so
    /// no later step can run without a release hook in place.
    pub fn create(slot: &CleanupSlot, parent: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .with_context(|| format!("failed to create workspace with prefix '{prefix}'"))?;

        let root = dir.path().to_path_buf();
        slot.hold(dir)?;
        debug!(path = %root.display(), "workspace created");

        Ok(Self {
            root,
            slot: slot.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.root.join("payload")
    }

    pub fn patched_library_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn release(self) -> Result<()> {
        self.slot.release().map(|_| ())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(err) = self.slot.release() {
            warn!(path = %self.root.display(), "{err:#}");
        }
    }
}
