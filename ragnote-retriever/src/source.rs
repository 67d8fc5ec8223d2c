//! Bulk document enumeration from a directory of note pages.
//!
//! A page is a Markdown (or Org) file; its id is the path relative to the notes root,
//! without the extension. Each page is split into blocks, one per outline bullet or
//! plain paragraph, and every non-empty block becomes a [`Document`] with id
//! `<page>#<n>`, numbered from zero in page order.

use crate::document::Document;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ignore::gitignore::Gitignore;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Something that can list the current documents.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Return at most `max` documents.
    async fn documents(&self, max: usize) -> Result<Vec<Document>>;
}

/// Enumerates blocks from the note pages under a root directory.
///
/// The walk honours `.gitignore` and `.ignore` files, in or out of a git repository,
/// and skips hidden entries, so the record store living in the same directory is never
/// picked up. [`is_visible_page`](Self::is_visible_page) applies the same rules to a
/// single path.
#[derive(Debug, Clone)]
pub struct NotesDirectorySource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl NotesDirectorySource {
    pub fn new<P: Into<PathBuf>>(root: P, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True if `path` has one of the configured page extensions.
    pub fn is_page(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// True if the directory walk would yield `path`.
    pub fn is_visible_page(&self, path: &Path) -> bool {
        if !self.is_page(path) {
            return false;
        }
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        let hidden = relative.components().any(|component| match component {
            Component::Normal(part) => part.to_str().is_some_and(|p| p.starts_with('.')),
            _ => false,
        });
        if hidden {
            return false;
        }

        // Deepest directory first; the first ignore file with an opinion decides
        for dir in path.ancestors().skip(1) {
            if !dir.starts_with(&self.root) {
                break;
            }
            for name in [".ignore", ".gitignore"] {
                let file = dir.join(name);
                if !file.is_file() {
                    continue;
                }
                let (matcher, err) = Gitignore::new(&file);
                if let Some(e) = err {
                    debug!("Problem reading {}: {}", file.display(), e);
                }
                let matched = matcher.matched_path_or_any_parents(path, false);
                if matched.is_ignore() {
                    return false;
                }
                if matched.is_whitelist() {
                    return true;
                }
            }
        }
        true
    }

    /// Page id for a file under the root, e.g. `journals/2024_01_05`.
    pub fn page_id(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?.with_extension("");
        let parts: Vec<&str> = relative
            .components()
            .map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Read one page and split it into documents.
    pub fn read_page(&self, path: &Path) -> Result<Vec<Document>> {
        let page_id = self
            .page_id(path)
            .with_context(|| format!("{} is not under {}", path.display(), self.root.display()))?;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read page {}", path.display()))?;
        Ok(blocks_for_page(&page_id, &text))
    }

    /// Page files under the root, sorted by path.
    pub fn page_paths(&self) -> Vec<PathBuf> {
        let mut pages = Vec::new();
        let walker = ignore::WalkBuilder::new(&self.root)
            .require_git(false)
            .git_global(false)
            .git_exclude(false)
            .build();
        for entry in walker {
            match entry {
                Ok(entry) => {
                    let is_file = entry.file_type().is_some_and(|t| t.is_file());
                    if is_file && self.is_page(entry.path()) {
                        pages.push(entry.into_path());
                    }
                }
                Err(e) => warn!("Skipping unreadable entry under {}: {}", self.root.display(), e),
            }
        }
        pages.sort();
        pages
    }

    fn collect(&self, max: usize) -> Vec<Document> {
        let mut documents = Vec::new();
        for path in self.page_paths() {
            if documents.len() >= max {
                break;
            }
            match self.read_page(&path) {
                Ok(blocks) => {
                    let room = max - documents.len();
                    documents.extend(blocks.into_iter().take(room));
                }
                Err(e) => warn!("Skipping page: {:#}", e),
            }
        }
        debug!(
            "Enumerated {} documents under {}",
            documents.len(),
            self.root.display()
        );
        documents
    }
}

#[async_trait]
impl DocumentSource for NotesDirectorySource {
    async fn documents(&self, max: usize) -> Result<Vec<Document>> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.collect(max))
            .await
            .context("document enumeration task failed")
    }
}

/// Split page text into block documents.
///
/// A line starting with `- ` or `* ` opens a new block, as does any line after a blank
/// one. Other lines continue the current block. Blank blocks are dropped before
/// numbering.
pub fn blocks_for_page(page_id: &str, text: &str) -> Vec<Document> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();

    fn finish(current: &mut String, blocks: &mut Vec<String>) {
        let block = current.trim();
        if !block.is_empty() {
            blocks.push(block.to_string());
        }
        current.clear();
    }

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            finish(&mut current, &mut blocks);
            continue;
        }

        let bullet = if line == "-" || line == "*" {
            Some("")
        } else {
            line.strip_prefix("- ").or_else(|| line.strip_prefix("* "))
        };

        match bullet {
            Some(rest) => {
                finish(&mut current, &mut blocks);
                current.push_str(rest);
            }
            None => {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(line);
            }
        }
    }
    finish(&mut current, &mut blocks);

    blocks
        .into_iter()
        .enumerate()
        .map(|(n, content)| Document::new(format!("{page_id}#{n}"), content))
        .collect()
}
