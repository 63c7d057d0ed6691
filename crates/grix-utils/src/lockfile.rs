use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::{Result, UtilError};

const LOCK_SUFFIX: &str = ".lock";

/// The `.lock` write protocol.
///
/// A holder owns `<target>.lock` (created with `O_CREAT|O_EXCL`, so one
/// holder at a time) and streams the replacement contents into it through
/// a buffered writer. [`commit`](LockFile::commit) flushes, fsyncs, and
/// renames the lock file onto the target in one step; every other exit
/// path, the destructor included, deletes the lock file and leaves the
/// target untouched.
///
/// For the common write-whole-file case, [`update`](LockFile::update)
/// scopes the acquisition around a fill closure and picks commit or
/// rollback from its result.
#[derive(Debug)]
pub struct LockFile {
    target: PathBuf,
    lock_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl LockFile {
    /// Take the lock for `target`, failing if another holder exists.
    pub fn acquire(target: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let mut lock_path = target.clone().into_os_string();
        lock_path.push(LOCK_SUFFIX);
        let lock_path = PathBuf::from(lock_path);

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(UtilError::AlreadyLocked { path: lock_path })
            }
            Err(e) => {
                return Err(UtilError::LockCreate {
                    path: lock_path,
                    source: e,
                })
            }
        };

        Ok(Self {
            target,
            lock_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Acquire, run `fill` to produce the new contents, then commit on
    /// success or roll back on error. The lock is released on every path.
    pub fn update<F>(target: impl AsRef<Path>, fill: F) -> Result<()>
    where
        F: FnOnce(&mut LockFile) -> io::Result<()>,
    {
        let mut lock = Self::acquire(target)?;
        match fill(&mut lock) {
            Ok(()) => lock.commit(),
            Err(e) => {
                lock.rollback()?;
                Err(UtilError::Io(e))
            }
        }
    }

    /// Destination path (without the `.lock` suffix).
    pub fn path(&self) -> &Path {
        &self.target
    }

    /// Path of the held lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Flush, fsync, and atomically rename the lock file onto the target.
    ///
    /// On failure the lock file is removed; a half-flushed file never
    /// stays behind holding the lock.
    pub fn commit(mut self) -> Result<()> {
        let writer = self
            .writer
            .take()
            .expect("writer present until commit or rollback");

        let outcome = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all().map(|()| file))
            .and_then(|file| {
                drop(file);
                fs::rename(&self.lock_path, &self.target)
            });

        match outcome {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&self.lock_path);
                Err(UtilError::LockCommit {
                    path: self.lock_path.clone(),
                    source,
                })
            }
        }
    }

    /// Discard the lock file without touching the target.
    pub fn rollback(mut self) -> Result<()> {
        self.writer.take();
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UtilError::Io(e)),
        }
    }
}

impl Write for LockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already released"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already released"))?
            .flush()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // A writer still present means neither commit nor rollback ran.
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_commits_on_success() {
        let dir = ::tempfile::tempdir().unwrap();
        let target = dir.path().join("index");
        fs::write(&target, b"old").unwrap();

        LockFile::update(&target, |lock| lock.write_all(b"new")).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!dir.path().join("index.lock").exists());
    }

    #[test]
    fn update_rolls_back_on_fill_error() {
        let dir = ::tempfile::tempdir().unwrap();
        let target = dir.path().join("index");
        fs::write(&target, b"untouched").unwrap();

        let result = LockFile::update(&target, |lock| {
            lock.write_all(b"half-written")?;
            Err(io::Error::other("serialization failed"))
        });

        assert!(result.is_err());
        assert_eq!(fs::read(&target).unwrap(), b"untouched");
        assert!(!dir.path().join("index.lock").exists());
    }

    #[test]
    fn contention_is_detected() {
        let dir = ::tempfile::tempdir().unwrap();
        let target = dir.path().join("index");

        let held = LockFile::acquire(&target).unwrap();
        assert!(held.lock_path().ends_with("index.lock"));

        match LockFile::acquire(&target) {
            Err(UtilError::AlreadyLocked { path }) => {
                assert_eq!(path, held.lock_path());
            }
            other => panic!("expected AlreadyLocked, got {other:?}"),
        }
        // Scoped updates see the same contention.
        assert!(matches!(
            LockFile::update(&target, |_| Ok(())),
            Err(UtilError::AlreadyLocked { .. })
        ));
    }

    #[test]
    fn lock_released_after_rollback_and_reacquirable() {
        let dir = ::tempfile::tempdir().unwrap();
        let target = dir.path().join("index");

        let lock = LockFile::acquire(&target).unwrap();
        lock.rollback().unwrap();

        // The slot is free again.
        LockFile::update(&target, |lock| lock.write_all(b"second try")).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second try");
    }

    #[test]
    fn drop_without_commit_cleans_up() {
        let dir = ::tempfile::tempdir().unwrap();
        let target = dir.path().join("index");
        fs::write(&target, b"original").unwrap();

        {
            let mut lock = LockFile::acquire(&target).unwrap();
            lock.write_all(b"abandoned").unwrap();
        }

        assert_eq!(fs::read(&target).unwrap(), b"original");
        assert!(!dir.path().join("index.lock").exists());
    }

    #[test]
    fn commit_creates_missing_target() {
        let dir = ::tempfile::tempdir().unwrap();
        let target = dir.path().join("brand-new");

        let mut lock = LockFile::acquire(&target).unwrap();
        lock.write_all(b"first contents").unwrap();
        lock.commit().unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"first contents");
    }

    #[test]
    fn buffered_writes_reach_disk_on_commit() {
        let dir = ::tempfile::tempdir().unwrap();
        let target = dir.path().join("big");

        LockFile::update(&target, |lock| {
            for chunk in 0..64u8 {
                lock.write_all(&[chunk; 1000])?;
            }
            Ok(())
        })
        .unwrap();

        let written = fs::read(&target).unwrap();
        assert_eq!(written.len(), 64_000);
        assert_eq!(written[999], 0);
        assert_eq!(written[63_999], 63);
    }
}
