//! Document model produced by the conversion pipeline.
//!
//! A [`Document`] owns its [`Page`]s and each page owns its [`Region`]s.
//! Geometry is expressed in PDF points with a top-left origin, so `y0 < y1`
//! always means "higher on the page comes first".
//!
//! Page bitmaps are held behind an `Arc` because the same image is handed to
//! several stages while a page is in flight; the page keeps the only
//! long-lived reference once assembly completes.

use crate::error::PageFault;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── Geometry ─────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in page points (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn center_x(&self) -> f32 {
        (self.x0 + self.x1) * 0.5
    }

    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) * 0.5
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Whether `other` lies inside this box, allowing half a point of slack
    /// for float rounding in the text layer.
    pub fn contains(&self, other: &Self) -> bool {
        const SLACK: f32 = 0.5;
        other.x0 >= self.x0 - SLACK
            && other.y0 >= self.y0 - SLACK
            && other.x1 <= self.x1 + SLACK
            && other.y1 <= self.y1 + SLACK
    }

    /// Union of every box in `boxes`, or `None` for an empty iterator.
    pub fn enclosing<'a>(boxes: impl IntoIterator<Item = &'a BoundingBox>) -> Option<Self> {
        boxes.into_iter().copied().reduce(|acc, b| acc.union(&b))
    }
}

/// A run of text read from the page's native text layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCell {
    pub text: String,
    pub bbox: BoundingBox,
}

impl TextCell {
    pub fn new(text: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            text: text.into(),
            bbox,
        }
    }
}

// ── Regions ──────────────────────────────────────────────────────────────

/// Structural role of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Text,
    Heading,
    Table,
    Figure,
}

/// Which stage produced a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Layout,
    Ocr,
    TableStructure,
}

/// One cell of a recognised table grid (0-based row/column).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    pub row: usize,
    pub col: usize,
    pub text: String,
    pub bbox: BoundingBox,
}

/// Row/column structure of a table region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStructure {
    pub num_rows: usize,
    pub num_cols: usize,
    pub cells: Vec<TableCell>,
}

impl TableStructure {
    /// Dense `num_rows × num_cols` grid of cell texts; missing cells are empty.
    pub fn grid(&self) -> Vec<Vec<String>> {
        let mut grid = vec![vec![String::new(); self.num_cols]; self.num_rows];
        for cell in &self.cells {
            if cell.row < self.num_rows && cell.col < self.num_cols {
                grid[cell.row][cell.col] = cell.text.clone();
            }
        }
        grid
    }

    /// True when every cell's geometry lies within `bounds`.
    pub fn fits_within(&self, bounds: &BoundingBox) -> bool {
        self.cells.iter().all(|c| bounds.contains(&c.bbox))
    }
}

/// A structural unit on a page: text block, heading, table or figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub kind: RegionKind,
    pub bbox: BoundingBox,
    /// Extracted text, if the region carries any.
    pub text: Option<String>,
    /// Cell structure, only for `RegionKind::Table` after the table stage ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableStructure>,
    /// Text-layer cells the region was built from.
    #[serde(skip)]
    pub cells: Vec<TextCell>,
    pub source: Provenance,
}

impl Region {
    pub fn new(kind: RegionKind, bbox: BoundingBox, text: Option<String>, source: Provenance) -> Self {
        Self {
            kind,
            bbox,
            text,
            table: None,
            cells: Vec::new(),
            source,
        }
    }

    pub fn with_cells(mut self, cells: Vec<TextCell>) -> Self {
        self.cells = cells;
        self
    }

    /// Whether the region contributes readable text.
    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

// ── Pages & documents ────────────────────────────────────────────────────

/// One page of a converted document.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    /// 1-based page number.
    pub index: usize,
    /// Page width in points (0 when the page could not be decoded).
    pub width: f32,
    /// Page height in points (0 when the page could not be decoded).
    pub height: f32,
    /// Rendered bitmap, kept only when image generation is enabled.
    #[serde(skip)]
    pub image: Option<Arc<DynamicImage>>,
    /// Regions in reading order.
    pub regions: Vec<Region>,
    /// Markdown rendering of `regions`.
    pub markdown: String,
    /// Faults recorded while processing this page.
    pub faults: Vec<PageFault>,
}

impl Page {
    /// A page that produced no content because it failed before any stage ran.
    pub fn faulted(index: usize, fault: PageFault) -> Self {
        Self {
            index,
            width: 0.0,
            height: 0.0,
            image: None,
            regions: Vec::new(),
            markdown: String::new(),
            faults: vec![fault],
        }
    }

    pub fn is_faulted(&self) -> bool {
        !self.faults.is_empty()
    }

    /// True when the page never got past rasterization.
    pub fn decode_failed(&self) -> bool {
        self.faults.iter().any(|f| matches!(f, PageFault::Decode { .. }))
    }

    /// True when the page has no bitmap because rasterization failed.
    pub fn raster_failed(&self) -> bool {
        self.faults
            .iter()
            .any(|f| matches!(f, PageFault::Decode { .. } | PageFault::Render { .. }))
    }
}

/// Metadata read from the PDF's document information dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

/// An assembled conversion result.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    /// Source identifier (usually the uploaded file name).
    pub name: String,
    /// Number of pages in the source document.
    pub total_pages: usize,
    /// Converted pages in ascending index order.
    pub pages: Vec<Page>,
    pub metadata: Option<DocumentMetadata>,
}

impl Document {
    /// Look up a page by its 1-based index.
    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages
            .binary_search_by_key(&index, |p| p.index)
            .ok()
            .map(|pos| &self.pages[pos])
    }

    pub fn faulted_pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter().filter(|p| p.is_faulted())
    }
}
