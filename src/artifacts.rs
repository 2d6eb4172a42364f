//! Artifact persistence.
//!
//! Every file the pipeline writes goes through an injected `ArtifactSink`
//! so tests can run against memory. Filenames are deterministic functions
//! of `(slug, page_index)`; the filesystem sink writes each file to a
//! temporary sibling and renames it into place.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use image::DynamicImage;
use serde::Serialize;

pub trait ArtifactSink: Send + Sync {
    fn write_bytes(&self, rel: &Path, bytes: &[u8]) -> anyhow::Result<()>;

    /// Absolute location of a relative artifact path, when the sink is
    /// backed by a real filesystem.
    fn resolve(&self, rel: &Path) -> Option<PathBuf> {
        let _ = rel;
        None
    }
}

pub fn write_json<T: Serialize>(
    sink: &dyn ArtifactSink,
    rel: &Path,
    value: &T,
) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(value).context("serializing artifact")?;
    sink.write_bytes(rel, &json)
}

pub fn write_png(
    sink: &dyn ArtifactSink,
    rel: &Path,
    image: &DynamicImage,
) -> anyhow::Result<()> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .context("encoding artifact image")?;
    sink.write_bytes(rel, buffer.get_ref())
}

pub fn original_rel(slug: &str, extension: &str) -> PathBuf {
    PathBuf::from(slug).join(format!("original.{extension}"))
}

pub fn page_image_rel(slug: &str, page_index: usize) -> PathBuf {
    PathBuf::from(slug)
        .join("pages")
        .join(format!("page_{page_index:03}.png"))
}

pub fn pre_image_rel(slug: &str, page_index: usize) -> PathBuf {
    PathBuf::from(slug)
        .join("pages")
        .join(format!("page_{page_index:03}.pre.png"))
}

pub fn layout_json_rel(slug: &str, page_index: usize) -> PathBuf {
    PathBuf::from(slug).join(format!("layout_page_{page_index:03}.json"))
}

pub fn ocr_json_rel(slug: &str, page_index: usize) -> PathBuf {
    PathBuf::from(slug).join(format!("ocr_page_{page_index:03}.json"))
}

pub fn debug_image_rel(slug: &str, page_index: usize) -> PathBuf {
    PathBuf::from(slug)
        .join("debug")
        .join(format!("page_{page_index:03}.png"))
}

pub fn manifest_rel(slug: &str) -> PathBuf {
    PathBuf::from(slug).join("ocr_output.json")
}

/// Filesystem sink rooted at the configured artifact directory.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactSink for FsArtifactSink {
    fn write_bytes(&self, rel: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let target = self.root.join(rel);
        let parent = target
            .parent()
            .context("artifact path has no parent directory")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;

        // Write-then-rename keeps readers from ever observing a torn file.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("creating temp file in {}", parent.display()))?;
        tmp.write_all(bytes).context("writing artifact")?;
        tmp.persist(&target)
            .with_context(|| format!("renaming into {}", target.display()))?;
        Ok(())
    }

    fn resolve(&self, rel: &Path) -> Option<PathBuf> {
        Some(self.root.join(rel))
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rel: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(rel).cloned()
    }

    pub fn get_json(&self, rel: &Path) -> Option<serde_json::Value> {
        self.get(rel)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().unwrap().keys().cloned().collect()
    }
}

impl ArtifactSink for MemorySink {
    fn write_bytes(&self, rel: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(rel.to_owned(), bytes.to_vec());
        Ok(())
    }
}
