//! Cone-mode sparse-checkout patterns.
//!
//! A cone is a hierarchical directory-inclusion set: a directory in the
//! cone is materialized recursively, its ancestors are materialized one
//! level deep, and everything else stays out of the working tree. The
//! pattern file lives at `$GIT_DIR/info/sparse-checkout`; in cone mode it
//! stores one anchored directory per line with glob metacharacters
//! escaped. Non-cone (full glob) patterns are carried verbatim but the
//! sparse-index contractor refuses to work with them.

use std::path::{Path, PathBuf};

use bstr::{BStr, BString, ByteSlice};

/// How a directory relates to the sparse cone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirMatch {
    /// Entirely outside the cone: a collapse candidate.
    NotMatched,
    /// Exactly a cone directory: contents fully materialized.
    Matched,
    /// A proper ancestor of a cone directory: descend.
    Ancestor,
    /// Inside a cone directory: contents materialized.
    Inside,
}

/// Sparse-checkout pattern state.
#[derive(Debug, Clone, Default)]
pub struct SparseCheckout {
    /// Whether sparse checkout is active (pattern file present).
    pub enabled: bool,
    /// Whether the patterns form a cone.
    pub cone_mode: bool,
    /// Cone directories, normalized: no leading or trailing slash.
    dirs: Vec<BString>,
    /// Raw pattern lines when not in cone mode.
    raw_patterns: Vec<BString>,
}

impl SparseCheckout {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cone over the given directories (testing and `set` convenience).
    pub fn cone<I, S>(dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sc = Self {
            enabled: true,
            cone_mode: true,
            ..Self::default()
        };
        sc.set_dirs(dirs);
        sc
    }

    /// Replace the cone directory set. Each input line is a directory
    /// path: a leading slash is optional, a trailing slash is stripped,
    /// and empty lines are ignored.
    pub fn set_dirs<I, S>(&mut self, dirs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dirs = dirs
            .into_iter()
            .filter_map(|line| normalize_dir(line.as_ref()))
            .collect();
        self.dirs.sort();
        self.dirs.dedup();
        self.cone_mode = true;
    }

    /// Cone directories in sorted order.
    pub fn dirs(&self) -> &[BString] {
        &self.dirs
    }

    /// Path of the pattern file under `git_dir`.
    pub fn pattern_file(git_dir: &Path) -> PathBuf {
        git_dir.join("info").join("sparse-checkout")
    }

    /// Load from `$GIT_DIR/info/sparse-checkout`; a missing file means
    /// sparse checkout is disabled. `cone_mode` comes from configuration,
    /// not from the file.
    pub fn from_file(git_dir: &Path, cone_mode: bool) -> std::io::Result<Self> {
        let path = Self::pattern_file(git_dir);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };

        let mut sc = Self {
            enabled: true,
            cone_mode,
            ..Self::default()
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.first() == Some(&b'#') {
                continue;
            }
            if cone_mode {
                let unescaped = unescape_glob(line);
                if let Some(dir) = normalize_dir_bytes(&unescaped) {
                    sc.dirs.push(dir);
                }
            } else {
                sc.raw_patterns.push(BString::from(line));
            }
        }
        sc.dirs.sort();
        sc.dirs.dedup();
        Ok(sc)
    }

    /// Write the pattern file. Cone directories go out anchored
    /// (`/dir/`) with glob metacharacters escaped.
    pub fn save(&self, git_dir: &Path) -> std::io::Result<()> {
        let path = Self::pattern_file(git_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut content: Vec<u8> = Vec::new();
        if self.cone_mode {
            for dir in &self.dirs {
                content.push(b'/');
                content.extend_from_slice(&escape_glob(dir));
                content.push(b'/');
                content.push(b'\n');
            }
        } else {
            for pattern in &self.raw_patterns {
                content.extend_from_slice(pattern);
                content.push(b'\n');
            }
        }
        std::fs::write(&path, content)
    }

    /// Enable sparse checkout with an empty cone (only toplevel files).
    pub fn init(git_dir: &Path) -> std::io::Result<Self> {
        let sc = Self {
            enabled: true,
            cone_mode: true,
            ..Self::default()
        };
        sc.save(git_dir)?;
        Ok(sc)
    }

    /// Remove the pattern file, disabling sparse checkout.
    pub fn disable(git_dir: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(Self::pattern_file(git_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Relation of directory `path` (no trailing slash) to the cone.
    ///
    /// Anything other than [`DirMatch::NotMatched`] means entries under
    /// `path` may be materialized, so the subtree must not collapse.
    pub fn dir_match(&self, path: &BStr) -> DirMatch {
        if !self.cone_mode {
            // Without a cone there is no directory-level answer; treat
            // everything as potentially materialized.
            return DirMatch::Matched;
        }
        for dir in &self.dirs {
            if dir.as_bstr() == path {
                return DirMatch::Matched;
            }
            if is_path_prefix(path, dir.as_bstr()) {
                return DirMatch::Ancestor;
            }
            if is_path_prefix(dir.as_bstr(), path) {
                return DirMatch::Inside;
            }
        }
        DirMatch::NotMatched
    }
}

/// Whether `prefix` is a proper path-component prefix of `path`.
fn is_path_prefix(prefix: &BStr, path: &BStr) -> bool {
    path.len() > prefix.len()
        && path.starts_with(prefix.as_bytes())
        && path[prefix.len()] == b'/'
}

fn normalize_dir(line: &str) -> Option<BString> {
    normalize_dir_bytes(line.trim().as_bytes())
}

fn normalize_dir_bytes(line: &[u8]) -> Option<BString> {
    let line = line.strip_prefix(b"/").unwrap_or(line);
    let line = line.strip_suffix(b"/").unwrap_or(line);
    if line.is_empty() {
        None
    } else {
        Some(BString::from(line))
    }
}

/// Escape glob metacharacters so a literal directory name survives
/// pattern-file syntax.
fn escape_glob(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len());
    for &b in name {
        if matches!(b, b'*' | b'?' | b'[' | b']' | b'\\') {
            out.push(b'\\');
        }
        out.push(b);
    }
    out
}

fn unescape_glob(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut iter = line.iter().copied();
    while let Some(b) = iter.next() {
        if b == b'\\' {
            match iter.next() {
                Some(next) => out.push(next),
                None => out.push(b),
            }
        } else {
            out.push(b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization() {
        let sc = SparseCheckout::cone(["/a/b/", "c", "", "  ", "/d"]);
        let dirs: Vec<_> = sc.dirs().iter().map(|d| d.to_string()).collect();
        assert_eq!(dirs, ["a/b", "c", "d"]);
    }

    #[test]
    fn dir_match_relations() {
        let sc = SparseCheckout::cone(["a/b"]);
        assert_eq!(sc.dir_match(b"a/b".into()), DirMatch::Matched);
        assert_eq!(sc.dir_match(b"a".into()), DirMatch::Ancestor);
        assert_eq!(sc.dir_match(b"a/b/c".into()), DirMatch::Inside);
        assert_eq!(sc.dir_match(b"a/bc".into()), DirMatch::NotMatched);
        assert_eq!(sc.dir_match(b"z".into()), DirMatch::NotMatched);
    }

    #[test]
    fn empty_cone_matches_nothing() {
        let sc = SparseCheckout::cone(Vec::<&str>::new());
        assert_eq!(sc.dir_match(b"any".into()), DirMatch::NotMatched);
    }

    #[test]
    fn file_roundtrip_with_escaping() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = dir.path();

        let sc = SparseCheckout::cone(["plain", "we[i]rd*name"]);
        sc.save(git_dir).unwrap();

        let content = std::fs::read_to_string(SparseCheckout::pattern_file(git_dir)).unwrap();
        assert!(content.contains("/plain/\n"));
        assert!(content.contains("/we\\[i\\]rd\\*name/\n"));

        let loaded = SparseCheckout::from_file(git_dir, true).unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.dirs(), sc.dirs());
    }

    #[test]
    fn missing_file_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let sc = SparseCheckout::from_file(dir.path(), true).unwrap();
        assert!(!sc.enabled);
        assert!(sc.dirs().is_empty());
    }

    #[test]
    fn init_and_disable() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = dir.path();

        let sc = SparseCheckout::init(git_dir).unwrap();
        assert!(sc.enabled);
        assert!(SparseCheckout::pattern_file(git_dir).exists());

        SparseCheckout::disable(git_dir).unwrap();
        assert!(!SparseCheckout::pattern_file(git_dir).exists());
        // Disabling twice is fine.
        SparseCheckout::disable(git_dir).unwrap();
    }

    #[test]
    fn non_cone_patterns_keep_lines() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = dir.path();
        let info = git_dir.join("info");
        std::fs::create_dir_all(&info).unwrap();
        std::fs::write(info.join("sparse-checkout"), "*.rs\n!target/\n").unwrap();

        let sc = SparseCheckout::from_file(git_dir, false).unwrap();
        assert!(sc.enabled);
        assert!(!sc.cone_mode);
        assert_eq!(sc.raw_patterns.len(), 2);
    }
}
