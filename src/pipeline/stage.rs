//! The stage adapter seam.
//!
//! Every analysis backend (layout, OCR, table structure) implements
//! [`StageBackend`]: accept a batch of [`StageItem`]s, return one result per
//! item in the same order. A per-item `Err` becomes a page fault; an outer
//! `Err` fails the whole conversion.

use crate::error::StageError;
use crate::model::{Region, TextCell};
use futures::future::BoxFuture;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The analysis stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Layout,
    Ocr,
    TableStructure,
}

impl StageKind {
    /// Every stage, in the order a page visits them.
    pub const ALL: [StageKind; 3] = [StageKind::Layout, StageKind::Ocr, StageKind::TableStructure];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Layout => "layout",
            StageKind::Ocr => "ocr",
            StageKind::TableStructure => "table_structure",
        }
    }

    /// Position in [`StageKind::ALL`].
    pub fn ordinal(self) -> usize {
        match self {
            StageKind::Layout => 0,
            StageKind::Ocr => 1,
            StageKind::TableStructure => 2,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page's input to a stage.
///
/// The bitmap and text layer are shared with the page in flight, never copied.
#[derive(Debug, Clone)]
pub struct StageItem {
    /// 1-based page number.
    pub page: usize,
    /// Page size in points.
    pub width: f32,
    pub height: f32,
    /// `None` when the page bitmap failed to render.
    pub image: Option<Arc<DynamicImage>>,
    pub text_cells: Arc<[TextCell]>,
    /// Regions produced by upstream stages.
    pub regions: Vec<Region>,
}

/// Per-item outcome: the page's full region list after this stage, or a
/// human-readable fault description.
pub type ItemResult = Result<Vec<Region>, String>;

/// A batch-oriented analysis backend.
pub trait StageBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Process one batch. Must return exactly `items.len()` results, in order.
    fn process_batch(&self, items: Vec<StageItem>) -> BoxFuture<'_, Result<Vec<ItemResult>, StageError>>;
}
