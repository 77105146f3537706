//! Page rasterizer: document bytes → a lazy feed of page bitmaps.
//!
//! ## Why a feed instead of a Vec?
//!
//! Rendering every page up front holds the whole document in memory as
//! bitmaps. The rasterizer instead renders one page at a time on a blocking
//! thread and pushes it into a small bounded channel; when the first stage
//! queue is full, the channel fills and the render thread parks. The feed is
//! finite, in page order, and cannot be restarted.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and is not async-safe.
//! `tokio::task::spawn_blocking` keeps its CPU-heavy rendering off the Tokio
//! worker threads, and `blocking_send` lets that thread wait on the channel.
//!
//! Besides the bitmap, each page carries its native text layer (segments with
//! top-left-origin geometry) for the layout stage.

use crate::config::{PageSelection, PipelineConfig};
use crate::error::{ConvertError, PageFault};
use crate::model::{BoundingBox, DocumentMetadata, TextCell};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One rasterized page.
#[derive(Debug, Clone)]
pub struct RasterPage {
    /// 1-based page number.
    pub index: usize,
    /// Page size in points.
    pub width: f32,
    pub height: f32,
    /// `None` when the bitmap failed to render; see `faults`.
    pub image: Option<Arc<DynamicImage>>,
    /// Native text layer, top-left origin, reading order.
    pub text_cells: Vec<TextCell>,
    /// Non-fatal rasterization faults ([`PageFault::Render`]).
    pub faults: Vec<PageFault>,
}

/// A page or the reason it could not be decoded.
pub type RasterResult = Result<RasterPage, PageFault>;

/// Lazy, finite sequence of rasterized pages in ascending page order.
#[derive(Debug)]
pub struct PageFeed {
    /// Page count of the source document.
    pub total_pages: usize,
    /// Selected 1-based page numbers, ascending. The feed yields at most one
    /// item per entry.
    pub expected: Vec<usize>,
    pub metadata: Option<DocumentMetadata>,
    rx: mpsc::Receiver<RasterResult>,
}

impl PageFeed {
    /// A feed driven by the caller, for pre-rendered or synthetic pages.
    pub fn channel(
        total_pages: usize,
        expected: Vec<usize>,
        capacity: usize,
    ) -> (mpsc::Sender<RasterResult>, PageFeed) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let feed = PageFeed {
            total_pages,
            expected,
            metadata: None,
            rx,
        };
        (tx, feed)
    }

    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Next page, or `None` once the rasterizer is done.
    pub async fn recv(&mut self) -> Option<RasterResult> {
        self.rx.recv().await
    }
}

/// What the render thread learns before the first page.
struct FeedHeader {
    total_pages: usize,
    expected: Vec<usize>,
    metadata: DocumentMetadata,
}

/// Render settings copied out of the config for the blocking thread.
struct RenderSettings {
    scale: f32,
    max_pixels: u32,
    password: Option<String>,
    pages: PageSelection,
}

/// Open a document and start rasterizing it in the background.
///
/// Returns once the page count is known. Input that is not a PDF is
/// [`ConvertError::DocumentUnreadable`] without ever reaching pdfium.
pub async fn open(
    bytes: Vec<u8>,
    name: &str,
    config: &PipelineConfig,
) -> Result<PageFeed, ConvertError> {
    check_format(&bytes, name)?;

    let settings = RenderSettings {
        scale: config.images_scale,
        max_pixels: config.max_rendered_pixels,
        password: config.password.clone(),
        pages: config.pages.clone(),
    };
    let (header_tx, header_rx) = oneshot::channel();
    let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
    let doc_name = name.to_string();

    tokio::task::spawn_blocking(move || produce(bytes, &doc_name, settings, header_tx, tx));

    let header = header_rx
        .await
        .map_err(|_| ConvertError::Internal("rasterizer exited before reading the document".into()))??;

    info!(
        "Document '{}' opened: {} pages, {} selected",
        name,
        header.total_pages,
        header.expected.len()
    );

    Ok(PageFeed {
        total_pages: header.total_pages,
        expected: header.expected,
        metadata: Some(header.metadata),
        rx,
    })
}

/// Read document metadata without rendering any page.
pub async fn read_metadata(
    bytes: Vec<u8>,
    name: &str,
    password: Option<String>,
) -> Result<DocumentMetadata, ConvertError> {
    check_format(&bytes, name)?;
    let doc_name = name.to_string();
    tokio::task::spawn_blocking(move || {
        let pdfium = bind_pdfium()?;
        let document = load(&pdfium, bytes, &doc_name, password.as_deref())?;
        Ok(document_metadata(&document))
    })
    .await
    .map_err(|e| ConvertError::Internal(format!("Metadata task panicked: {}", e)))?
}

/// Reject empty input and anything without a `%PDF` header in its first KiB.
fn check_format(bytes: &[u8], name: &str) -> Result<(), ConvertError> {
    if bytes.is_empty() {
        return Err(ConvertError::DocumentUnreadable {
            name: name.to_string(),
            reason: "document is empty".into(),
        });
    }
    let head = &bytes[..bytes.len().min(1024)];
    if !head.windows(4).any(|w| w == b"%PDF") {
        return Err(ConvertError::DocumentUnreadable {
            name: name.to_string(),
            reason: "unsupported format: no PDF header found".into(),
        });
    }
    Ok(())
}

fn bind_pdfium() -> Result<Pdfium, ConvertError> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| ConvertError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

fn load<'a>(
    pdfium: &'a Pdfium,
    bytes: Vec<u8>,
    name: &str,
    password: Option<&str>,
) -> Result<PdfDocument<'a>, ConvertError> {
    pdfium.load_pdf_from_byte_vec(bytes, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                ConvertError::WrongPassword {
                    name: name.to_string(),
                }
            } else {
                ConvertError::PasswordRequired {
                    name: name.to_string(),
                }
            }
        } else {
            ConvertError::DocumentUnreadable {
                name: name.to_string(),
                reason: err_str,
            }
        }
    })
}

/// Blocking producer: runs on the blocking pool for the life of the feed.
fn produce(
    bytes: Vec<u8>,
    name: &str,
    settings: RenderSettings,
    header_tx: oneshot::Sender<Result<FeedHeader, ConvertError>>,
    tx: mpsc::Sender<RasterResult>,
) {
    let pdfium = match bind_pdfium() {
        Ok(p) => p,
        Err(e) => {
            let _ = header_tx.send(Err(e));
            return;
        }
    };
    let document = match load(&pdfium, bytes, name, settings.password.as_deref()) {
        Ok(d) => d,
        Err(e) => {
            let _ = header_tx.send(Err(e));
            return;
        }
    };

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let expected = settings.pages.to_indices(total_pages);
    let header = FeedHeader {
        total_pages,
        expected: expected.clone(),
        metadata: document_metadata(&document),
    };
    if header_tx.send(Ok(header)).is_err() {
        return;
    }

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(settings.scale)
        .set_maximum_width(settings.max_pixels as i32)
        .set_maximum_height(settings.max_pixels as i32);

    for index in expected {
        let item = render_page(pages, index, &render_config);
        if let Err(fault) = &item {
            warn!("{}", fault);
        }
        if tx.blocking_send(item).is_err() {
            debug!("Page consumer gone; rasterizer stopping before page {}", index);
            return;
        }
    }
    debug!("Rasterizer finished '{}'", name);
}

fn render_page(
    pages: &PdfPages<'_>,
    index: usize,
    render_config: &PdfRenderConfig,
) -> RasterResult {
    let decode = |detail: String| PageFault::Decode {
        page: index,
        detail,
    };

    let page = pages
        .get((index - 1) as u16)
        .map_err(|e| decode(format!("{:?}", e)))?;
    let width = page.width().value;
    let height = page.height().value;

    let mut faults = Vec::new();
    let image = match page.render_with_config(render_config) {
        Ok(bitmap) => Some(bitmap.as_image()),
        Err(e) => {
            let fault = PageFault::Render {
                page: index,
                detail: format!("{:?}", e),
            };
            warn!("{}", fault);
            faults.push(fault);
            None
        }
    };

    let text_cells = match extract_text_cells(&page, height) {
        Ok(cells) => cells,
        Err(detail) => {
            warn!("Page {}: text layer unreadable ({}), continuing without it", index, detail);
            Vec::new()
        }
    };

    match &image {
        Some(image) => debug!(
            "Rendered page {} → {}x{} px, {} text cells",
            index,
            image.width(),
            image.height(),
            text_cells.len()
        ),
        None => debug!("Page {} has no bitmap, {} text cells", index, text_cells.len()),
    }

    Ok(RasterPage {
        index,
        width,
        height,
        image: image.map(Arc::new),
        text_cells,
        faults,
    })
}

/// Text segments of a page with a top-left origin, sorted top to bottom
/// then left to right.
fn extract_text_cells(page: &PdfPage<'_>, page_height: f32) -> Result<Vec<TextCell>, String> {
    let text = page.text().map_err(|e| format!("{:?}", e))?;

    let mut cells = Vec::new();
    for segment in text.segments().iter() {
        let content = segment.text();
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let bounds = segment.bounds();
        cells.push(TextCell::new(
            content,
            BoundingBox::new(
                bounds.left().value,
                page_height - bounds.top().value,
                bounds.right().value,
                page_height - bounds.bottom().value,
            ),
        ));
    }

    sort_reading_order(&mut cells);
    Ok(cells)
}

pub(crate) fn sort_reading_order(cells: &mut [TextCell]) {
    cells.sort_by(|a, b| {
        a.bbox
            .y0
            .total_cmp(&b.bbox.y0)
            .then(a.bbox.x0.total_cmp(&b.bbox.x0))
    });
}

fn document_metadata(document: &PdfDocument<'_>) -> DocumentMetadata {
    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        creation_date: get_meta(PdfDocumentMetadataTagType::CreationDate),
        modification_date: get_meta(PdfDocumentMetadataTagType::ModificationDate),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
    }
}
