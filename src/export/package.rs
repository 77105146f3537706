//! Response packages: the JSON aggregate, the per-page ZIP archive and the
//! on-disk result set.

use crate::config::PageSeparator;
use crate::error::{ConvertError, PageFault};
use crate::export::image::{page_image, page_image_base64, ImageFormat};
use crate::export::markdown::document_markdown;
use crate::model::{Document, Page};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Used when the caller did not name the upload.
pub const DEFAULT_FILE_NAME: &str = "uploaded_file.pdf";

// ── JSON aggregate ───────────────────────────────────────────────────────

/// One page of the aggregate response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<PageFault>,
}

/// The whole document in one JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub file_name: String,
    pub file_size: usize,
    pub total_pages: usize,
    pub pages: Vec<PageContent>,
}

impl AggregateResponse {
    /// Build the aggregate. With `include_images`, every page must have its
    /// bitmap; a missing one fails the whole response.
    pub fn build(doc: &Document, file_size: usize, include_images: bool) -> Result<Self, ConvertError> {
        let pages = doc
            .pages
            .iter()
            .map(|page| {
                let image_base64 = if include_images {
                    Some(page_image_base64(page, ImageFormat::Jpeg)?)
                } else {
                    None
                };
                Ok(PageContent {
                    content: page.markdown.clone(),
                    image_base64,
                    faults: page.faults.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConvertError>>()?;

        Ok(Self {
            file_name: doc.name.clone(),
            file_size,
            total_pages: doc.total_pages,
            pages,
        })
    }
}

/// Full-document Markdown body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkdownResponse {
    pub content: String,
}

impl MarkdownResponse {
    pub fn build(doc: &Document, separator: &PageSeparator) -> Self {
        Self {
            content: document_markdown(doc, separator),
        }
    }
}

// ── ZIP archive ──────────────────────────────────────────────────────────

/// Incremental archive of `<n>.md` and `<n>.jpeg` entries.
///
/// Pages are added in the order they are handed in; feed it from an
/// in-order page stream to get a page-ordered archive.
pub struct ArchiveBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
    pages: usize,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            pages: 0,
        }
    }

    /// Add one page. The image is encoded before anything is written, so a
    /// page without a bitmap leaves the archive untouched.
    pub fn add_page(&mut self, page: &Page) -> Result<(), ConvertError> {
        let jpeg = page_image(page, ImageFormat::Jpeg)?;
        self.entry(format!("{}.md", page.index), page.markdown.as_bytes())?;
        self.entry(format!("{}.{}", page.index, ImageFormat::Jpeg.extension()), &jpeg)?;
        self.pages += 1;
        Ok(())
    }

    fn entry(&mut self, name: String, bytes: &[u8]) -> Result<(), ConvertError> {
        self.writer
            .start_file(name, self.options)
            .map_err(|e| ConvertError::Archive(e.to_string()))?;
        self.writer
            .write_all(bytes)
            .map_err(|e| ConvertError::Archive(e.to_string()))
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Finish the central directory and return the archive bytes.
    pub fn finish(self) -> Result<Vec<u8>, ConvertError> {
        let cursor = self
            .writer
            .finish()
            .map_err(|e| ConvertError::Archive(e.to_string()))?;
        debug!("Archive finished: {} pages", self.pages);
        Ok(cursor.into_inner())
    }
}

/// Archive of an already assembled document.
pub fn build_archive(doc: &Document) -> Result<Vec<u8>, ConvertError> {
    let mut builder = ArchiveBuilder::new();
    for page in &doc.pages {
        builder.add_page(page)?;
    }
    builder.finish()
}

// ── Persisted result set ─────────────────────────────────────────────────

/// What a persist request reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistSummary {
    pub file_name: String,
    pub file_size: usize,
    pub total_pages: usize,
}

/// Write `page_<n>.md` and `page_<n>.png` for every page into a fresh
/// directory under `root`. Returns the directory and the summary.
///
/// Images are encoded before the directory is created, so a page without a
/// bitmap leaves nothing behind.
pub async fn persist(
    doc: &Document,
    file_size: usize,
    root: &Path,
) -> Result<(PathBuf, PersistSummary), ConvertError> {
    let images = doc
        .pages
        .iter()
        .map(|page| page_image(page, ImageFormat::Png))
        .collect::<Result<Vec<_>, _>>()?;

    let dir = root.join(uuid::Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| ConvertError::OutputWriteFailed {
            path: dir.clone(),
            source,
        })?;

    for (page, png) in doc.pages.iter().zip(images) {
        write_file(&dir.join(format!("page_{}.md", page.index)), page.markdown.as_bytes()).await?;
        write_file(&dir.join(format!("page_{}.png", page.index)), &png).await?;
    }

    info!("Persisted {} pages to {}", doc.pages.len(), dir.display());
    Ok((
        dir,
        PersistSummary {
            file_name: doc.name.clone(),
            file_size,
            total_pages: doc.total_pages,
        },
    ))
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ConvertError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| ConvertError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        })
}
