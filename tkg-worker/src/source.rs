//! Loads documents from a directory tree.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::warn;

use tkg_ingest::model::{Document, SourceMetadata, TrustLevel};

/// Maximum directory recursion depth.
const MAX_DEPTH: usize = 50;

const EXTENSIONS: &[&str] = &["txt", "md"];

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: usize, max: usize },

    #[error("File is not valid UTF-8: {0}")]
    NotUtf8(String),

    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl SourceError {
    fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        SourceError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Reads `.txt` and `.md` files under `root` as documents.
///
/// `root` should be canonical (see `Config::validate_input`). Symlinks are
/// not followed.
pub struct DocumentSource {
    root: PathBuf,
    max_file_size: usize,
}

impl DocumentSource {
    pub fn new(root: PathBuf, max_file_size: usize) -> Self {
        Self {
            root,
            max_file_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every document file under the root, sorted.
    pub async fn list_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let mut stack: Vec<(PathBuf, usize)> = vec![(self.root.clone(), 0)];
        let mut results = Vec::new();

        while let Some((dir, depth)) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| SourceError::io(dir.display(), e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SourceError::io(dir.display(), e))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| SourceError::io(path.display(), e))?;

                if meta.is_dir() {
                    if depth < MAX_DEPTH {
                        stack.push((path, depth + 1));
                    }
                } else if meta.is_file() && has_document_extension(&path) {
                    results.push(path);
                }
            }
        }

        results.sort();
        Ok(results)
    }

    /// Read one file. The origin is the path relative to the root and the
    /// timestamp is the file's modification time.
    pub async fn load(&self, path: &Path) -> Result<Document, SourceError> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| SourceError::io(path.display(), e))?;
        let size = meta.len() as usize;
        if size > self.max_file_size {
            return Err(SourceError::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let bytes = fs::read(path)
            .await
            .map_err(|e| SourceError::io(path.display(), e))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| SourceError::NotUtf8(path.display().to_string()))?;

        let timestamp = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let origin = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        Ok(Document::new(
            text,
            SourceMetadata {
                origin,
                timestamp,
                trust: TrustLevel::Standard,
            },
        ))
    }

    /// Load every document file, skipping (and logging) the ones that fail.
    pub async fn load_all(&self) -> Result<Vec<Document>, SourceError> {
        let mut documents = Vec::new();
        for path in self.list_files().await? {
            match self.load(&path).await {
                Ok(doc) if doc.text.trim().is_empty() => {
                    warn!(path = %path.display(), "skipping empty document");
                }
                Ok(doc) => documents.push(doc),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable document"),
            }
        }
        Ok(documents)
    }
}

fn has_document_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Temporary input directory with a write helper.
    struct TempInbox {
        dir: TempDir,
    }

    impl TempInbox {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().expect("create temp dir"),
            }
        }

        fn write(&self, rel: &str, content: &[u8]) -> &Self {
            let full = self.dir.path().join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).expect("create parent dirs");
            }
            std::fs::write(&full, content).expect("write test file");
            self
        }

        fn source(&self, max_file_size: usize) -> DocumentSource {
            DocumentSource::new(self.dir.path().to_path_buf(), max_file_size)
        }
    }

    #[tokio::test]
    async fn lists_only_document_files_recursively() {
        let inbox = TempInbox::new();
        inbox
            .write("a.txt", b"Alpha.")
            .write("notes/b.MD", b"Beta.")
            .write("notes/deep/c.md", b"Gamma.")
            .write("image.png", b"\x89PNG");

        let files = inbox.source(1024).list_files().await.unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.MD", "c.md"]);
    }

    #[tokio::test]
    async fn load_sets_relative_origin() {
        let inbox = TempInbox::new();
        inbox.write("news/acme.txt", b"Acme Corp acquired Beta Inc in 2020.");
        let source = inbox.source(1024);
        let path = inbox.dir.path().join("news/acme.txt");

        let doc = source.load(&path).await.unwrap();
        assert_eq!(doc.text, "Acme Corp acquired Beta Inc in 2020.");
        assert_eq!(doc.metadata.origin, Path::new("news").join("acme.txt").to_string_lossy());
    }

    #[tokio::test]
    async fn oversized_and_binary_files_are_skipped() {
        let inbox = TempInbox::new();
        inbox
            .write("ok.txt", b"Fine.")
            .write("big.txt", &[b'a'; 64])
            .write("bad.txt", &[0xff, 0xfe, 0xfd])
            .write("blank.md", b"   \n");
        let source = inbox.source(32);

        let err = source.load(&inbox.dir.path().join("big.txt")).await.unwrap_err();
        assert!(matches!(err, SourceError::FileTooLarge { size: 64, max: 32 }));

        let docs = source.load_all().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "Fine.");
    }
}
