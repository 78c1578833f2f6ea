//! Remote file operations under the managed root
//!
//! `removeDir` and `writeFiles` let a client on another machine replace a
//! unit's files. Every path is relative to the managed root; absolute paths,
//! drive prefixes and `..` components are rejected before touching disk.

use base64::Engine;
use hotdeploy_api::FileEntry;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors from managed-root file operations
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("Path escapes the managed root: {0}")]
    OutsideRoot(String),

    #[error("Refusing to operate on the managed root itself")]
    RootTarget,

    #[error("Invalid base64 content for {path}: {reason}")]
    Content { path: String, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileOpError {
    /// Whether the caller supplied a bad argument (as opposed to a disk failure)
    pub fn is_invalid_argument(&self) -> bool {
        !matches!(self, FileOpError::Io { .. })
    }
}

/// File operations confined to one root directory
#[derive(Debug, Clone)]
pub struct ManagedFiles {
    root: PathBuf,
}

impl ManagedFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client-supplied relative path inside the root
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, FileOpError> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;

        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(FileOpError::OutsideRoot(relative.to_string()));
                }
            }
        }

        // Backslashes are separators on the wire regardless of platform
        if relative.contains('\\') || relative.contains(':') {
            return Err(FileOpError::OutsideRoot(relative.to_string()));
        }

        if depth == 0 {
            return Err(FileOpError::RootTarget);
        }
        Ok(resolved)
    }

    /// Recursively delete `relative`; succeeds when it does not exist
    pub async fn remove_dir(&self, relative: &str) -> Result<bool, FileOpError> {
        let target = self.resolve(relative)?;
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {
                tracing::debug!(path = %target.display(), "Removed directory");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(source) => Err(FileOpError::Io {
                path: target,
                source,
            }),
        }
    }

    /// Write every entry, creating parent directories.
    ///
    /// All paths and payloads are validated before the first write. Returns
    /// the number of files written.
    pub async fn write_files(&self, files: &[FileEntry]) -> Result<usize, FileOpError> {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut decoded = Vec::with_capacity(files.len());
        for file in files {
            let target = self.resolve(&file.path)?;
            let bytes = engine
                .decode(file.content.as_bytes())
                .map_err(|e| FileOpError::Content {
                    path: file.path.clone(),
                    reason: e.to_string(),
                })?;
            decoded.push((target, bytes));
        }

        for (target, bytes) in &decoded {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| FileOpError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            tokio::fs::write(target, bytes)
                .await
                .map_err(|source| FileOpError::Io {
                    path: target.clone(),
                    source,
                })?;
        }

        if !decoded.is_empty() {
            tracing::debug!(count = decoded.len(), "Wrote files");
        }
        Ok(decoded.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, bytes: &[u8]) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let files = ManagedFiles::new("/srv/units");
        assert_eq!(
            files.resolve("sample/index.js").unwrap(),
            PathBuf::from("/srv/units/sample/index.js")
        );
        assert_eq!(
            files.resolve("./sample").unwrap(),
            PathBuf::from("/srv/units/sample")
        );
        for bad in ["../etc", "sample/../../x", "/etc/passwd", "a\\..\\b", "C:x"] {
            assert!(
                matches!(files.resolve(bad), Err(FileOpError::OutsideRoot(_))),
                "{}",
                bad
            );
        }
        assert!(matches!(files.resolve(""), Err(FileOpError::RootTarget)));
        assert!(matches!(files.resolve("."), Err(FileOpError::RootTarget)));
    }

    #[tokio::test]
    async fn test_write_then_remove() {
        let temp = TempDir::new().unwrap();
        let files = ManagedFiles::new(temp.path());

        let written = files
            .write_files(&[
                entry("sample/manifest.json", br#"{"name":"sample"}"#),
                entry("sample/dist/index.js", b"console.log(1)"),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            std::fs::read(temp.path().join("sample/dist/index.js")).unwrap(),
            b"console.log(1)"
        );

        assert!(files.remove_dir("sample").await.unwrap());
        assert!(!temp.path().join("sample").exists());
        // Already gone
        assert!(files.remove_dir("sample").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_write_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let files = ManagedFiles::new(temp.path());
        assert_eq!(files.write_files(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_entry_aborts_before_writing() {
        let temp = TempDir::new().unwrap();
        let files = ManagedFiles::new(temp.path());

        let err = files
            .write_files(&[
                entry("sample/a.txt", b"a"),
                FileEntry {
                    path: "sample/b.txt".to_string(),
                    content: "%%% not base64".to_string(),
                },
            ])
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(!temp.path().join("sample/a.txt").exists());

        let err = files
            .write_files(&[entry("../escape.txt", b"x")])
            .await
            .unwrap_err();
        assert!(matches!(err, FileOpError::OutsideRoot(_)));
    }
}
