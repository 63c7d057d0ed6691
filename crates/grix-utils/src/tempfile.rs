use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::Result;

/// Temporary file for atomic writes, deleted on drop unless persisted.
///
/// The file is created in the same directory as its eventual target so the
/// final rename never crosses a filesystem boundary.
pub struct TempFile {
    inner: Option<::tempfile::NamedTempFile>,
}

impl TempFile {
    /// Create a uniquely named temp file inside `dir`.
    pub fn new_in(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let named = ::tempfile::NamedTempFile::new_in(dir)?;
        Ok(Self { inner: Some(named) })
    }

    /// Create a temp file in the directory that contains `target`.
    pub fn new_for(target: impl AsRef<Path>) -> Result<Self> {
        let dir = target.as_ref().parent().unwrap_or(Path::new("."));
        Self::new_in(dir)
    }

    /// Create a temp file inside `dir` whose name starts with `prefix`
    /// (e.g. `tmp_midx_` for multi-pack index builds).
    pub fn with_prefix_in(prefix: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let named = ::tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
        Ok(Self { inner: Some(named) })
    }

    /// Current path of the temp file.
    pub fn path(&self) -> &Path {
        self.inner
            .as_ref()
            .map(|n| n.path())
            .unwrap_or(Path::new(""))
    }

    /// Mutable access to the underlying file handle.
    pub fn file_mut(&mut self) -> Option<&mut fs::File> {
        self.inner.as_mut().map(|n| n.as_file_mut())
    }

    /// Fsync and rename onto `target`, consuming the temp file.
    pub fn persist(mut self, target: impl AsRef<Path>) -> Result<()> {
        if let Some(named) = self.inner.take() {
            named.as_file().sync_all()?;
            named
                .persist(target.as_ref())
                .map_err(|e| crate::UtilError::Io(e.error))?;
        }
        Ok(())
    }
}

impl Write for TempFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))?
            .flush()
    }
}
