//! Table-structure recognition by grid clustering.
//!
//! For every table region the supporting text cells are clustered into rows
//! (by vertical centre) and columns (by the union of their horizontal
//! extents). Each grid cell's box is the union of the text cells that fall
//! into it, so cell geometry always stays inside the region.

use crate::error::StageError;
use crate::model::{BoundingBox, Provenance, Region, RegionKind, TableCell, TableStructure, TextCell};
use crate::pipeline::stage::{ItemResult, StageBackend, StageItem};
use futures::future::BoxFuture;
use std::collections::BTreeMap;

/// Grid-clustering table backend.
#[derive(Debug, Clone)]
pub struct GridTableStructure {
    /// Vertical centres closer than this share a row.
    pub row_tolerance: f32,
    /// Horizontal extents closer than this share a column.
    pub column_slack: f32,
}

impl Default for GridTableStructure {
    fn default() -> Self {
        Self {
            row_tolerance: 3.0,
            column_slack: 2.0,
        }
    }
}

impl GridTableStructure {
    /// Row/column structure of one table region's cells.
    pub fn recognize(&self, cells: &[TextCell]) -> Option<TableStructure> {
        if cells.is_empty() {
            return None;
        }
        let rows = self.rows(cells);
        let columns = self.columns(cells);

        let mut grid: BTreeMap<(usize, usize), (Vec<&str>, BoundingBox)> = BTreeMap::new();
        for (row, members) in rows.iter().enumerate() {
            for cell in members {
                let col = columns
                    .iter()
                    .position(|&(x0, x1)| cell.bbox.center_x() >= x0 && cell.bbox.center_x() <= x1)
                    .unwrap_or(columns.len() - 1);
                grid.entry((row, col))
                    .and_modify(|(texts, bbox)| {
                        texts.push(&cell.text);
                        *bbox = bbox.union(&cell.bbox);
                    })
                    .or_insert_with(|| (vec![cell.text.as_str()], cell.bbox));
            }
        }

        Some(TableStructure {
            num_rows: rows.len(),
            num_cols: columns.len(),
            cells: grid
                .into_iter()
                .map(|((row, col), (texts, bbox))| TableCell {
                    row,
                    col,
                    text: texts.join(" "),
                    bbox,
                })
                .collect(),
        })
    }

    fn rows<'a>(&self, cells: &'a [TextCell]) -> Vec<Vec<&'a TextCell>> {
        let mut sorted: Vec<&TextCell> = cells.iter().collect();
        sorted.sort_by(|a, b| a.bbox.center_y().total_cmp(&b.bbox.center_y()));

        let mut rows: Vec<Vec<&TextCell>> = Vec::new();
        for cell in sorted {
            match rows.last_mut() {
                Some(row)
                    if row.first().is_some_and(|first| {
                        cell.bbox.center_y() - first.bbox.center_y() <= self.row_tolerance
                    }) =>
                {
                    row.push(cell)
                }
                _ => rows.push(vec![cell]),
            }
        }
        for row in &mut rows {
            row.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
        }
        rows
    }

    /// Column intervals, left to right.
    fn columns(&self, cells: &[TextCell]) -> Vec<(f32, f32)> {
        let mut spans: Vec<(f32, f32)> = cells.iter().map(|c| (c.bbox.x0, c.bbox.x1)).collect();
        spans.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut columns: Vec<(f32, f32)> = Vec::new();
        for (x0, x1) in spans {
            match columns.last_mut() {
                Some(last) if x0 <= last.1 + self.column_slack => last.1 = last.1.max(x1),
                _ => columns.push((x0, x1)),
            }
        }
        columns
    }

    fn refine(&self, item: &StageItem) -> ItemResult {
        let mut regions = item.regions.clone();
        for (i, region) in regions.iter_mut().enumerate() {
            if region.kind != RegionKind::Table {
                continue;
            }
            match self.recognize(&region.cells) {
                Some(structure) => {
                    region.table = Some(structure);
                    region.source = Provenance::TableStructure;
                }
                // Regions transcribed by OCR arrive with their structure already parsed.
                None if region.table.is_some() => {}
                None => return Err(format!("table region {} has no text cells", i + 1)),
            }
        }
        Ok(regions)
    }
}

impl StageBackend for GridTableStructure {
    fn name(&self) -> &str {
        "grid-table-structure"
    }

    fn process_batch(&self, items: Vec<StageItem>) -> BoxFuture<'_, Result<Vec<ItemResult>, StageError>> {
        Box::pin(async move { Ok(items.iter().map(|item| self.refine(item)).collect()) })
    }
}
