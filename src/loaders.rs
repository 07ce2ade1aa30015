//! File loaders: turn `.pdf`, `.md`, and `.txt` files into [`Document`]s.
//!
//! Every path is checked before any file is read, so a bad argument fails
//! fast instead of after minutes of PDF extraction. Directories are walked
//! recursively and contribute only files with an allowed extension.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::error::RagError;
use crate::models::{keys, Document, ObjectType};

pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "md", "txt"];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

fn is_allowed(path: &Path) -> bool {
    extension(path)
        .map(|e| ALLOWED_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// Resolve arguments into a sorted list of loadable files.
///
/// Explicit file arguments must exist and carry an allowed extension.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if !path.exists() {
            return Err(RagError::FileNotFound(path.clone()).into());
        }
        if path.is_dir() {
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry?;
                if entry.file_type().is_file() && is_allowed(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            continue;
        }
        if !is_allowed(path) {
            return Err(RagError::UnsupportedFileType {
                path: path.clone(),
                extension: extension(path)
                    .map(|e| format!(".{}", e))
                    .unwrap_or_else(|| "(none)".to_string()),
            }
            .into());
        }
        files.push(path.clone());
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// Load one file. Metadata carries `source` (the path) and
/// `object_type = "file"`.
pub fn load_document(path: &Path) -> Result<Document> {
    let text = match extension(path).as_deref() {
        Some("pdf") => pdf_extract::extract_text(path)
            .map_err(|e| anyhow::anyhow!("PDF extraction failed for {}: {}", path.display(), e))?,
        Some("md") | Some("txt") => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
        other => {
            return Err(RagError::UnsupportedFileType {
                path: path.to_path_buf(),
                extension: other.map(|e| format!(".{}", e)).unwrap_or_default(),
            }
            .into())
        }
    };

    Ok(Document::new(text)
        .with_meta(keys::SOURCE, path.display().to_string())
        .with_meta(keys::OBJECT_TYPE, ObjectType::File.as_str()))
}

/// Validate every path, then load each file in order.
pub fn load_documents(paths: &[PathBuf]) -> Result<Vec<Document>> {
    let files = expand_paths(paths)?;
    let mut docs = Vec::with_capacity(files.len());
    for file in &files {
        let doc = load_document(file)?;
        tracing::debug!(path = %file.display(), chars = doc.content.len(), "loaded file");
        docs.push(doc);
    }
    Ok(docs)
}
