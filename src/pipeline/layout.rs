//! Text-layer layout analysis.
//!
//! Builds regions from the geometry of the page's native text segments:
//!
//! 1. **Lines** — segments whose vertical centres are within `row_tolerance`
//!    of each other form one line.
//! 2. **Columns** — inside a line, a horizontal gap wider than `column_gap`
//!    starts a new column.
//! 3. **Tables** — at least `min_table_rows` consecutive lines with the same
//!    number of columns (at least `min_table_cols`, ±1 tolerated) form a table.
//! 4. **Blocks** — remaining lines merge into paragraphs while the vertical
//!    gap stays under `paragraph_gap × median line height`; lines noticeably
//!    taller than the median become headings.
//!
//! A page with no text layer yields one page-sized figure region, which is
//! what sends scanned pages on to OCR.

use crate::error::StageError;
use crate::model::{BoundingBox, Provenance, Region, RegionKind, TextCell};
use crate::pipeline::stage::{ItemResult, StageBackend, StageItem};
use futures::future::BoxFuture;

/// Tunables for [`TextLayerLayout`], in PDF points unless noted.
#[derive(Debug, Clone)]
pub struct LayoutSettings {
    pub row_tolerance: f32,
    pub column_gap: f32,
    /// Multiple of the median line height.
    pub paragraph_gap: f32,
    /// Multiple of the median line height.
    pub heading_ratio: f32,
    pub min_table_rows: usize,
    pub min_table_cols: usize,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            row_tolerance: 3.0,
            column_gap: 12.0,
            paragraph_gap: 0.8,
            heading_ratio: 1.3,
            min_table_rows: 2,
            min_table_cols: 2,
        }
    }
}

/// Layout backend over the native text layer.
#[derive(Debug, Clone, Default)]
pub struct TextLayerLayout {
    settings: LayoutSettings,
}

/// One visual line, split into column groups.
struct Line<'a> {
    columns: Vec<Vec<&'a TextCell>>,
    bbox: BoundingBox,
}

impl Line<'_> {
    fn text(&self) -> String {
        self.columns
            .iter()
            .map(|col| join_cells(col))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn owned_cells(lines: &[Line<'_>]) -> Vec<TextCell> {
    lines
        .iter()
        .flat_map(|l| l.columns.iter().flatten().map(|c| (*c).clone()))
        .collect()
}

fn join_cells(cells: &[&TextCell]) -> String {
    cells
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

impl TextLayerLayout {
    pub fn new(settings: LayoutSettings) -> Self {
        Self { settings }
    }

    /// Regions for one page, in reading order.
    pub fn analyze(&self, item: &StageItem) -> Vec<Region> {
        if item.text_cells.is_empty() {
            return vec![Region::new(
                RegionKind::Figure,
                BoundingBox::new(0.0, 0.0, item.width, item.height),
                None,
                Provenance::Layout,
            )];
        }

        let lines = self.lines(&item.text_cells);
        let median_height = median(lines.iter().map(|l| l.bbox.height()).collect());
        let mut regions = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let run = self.table_run(&lines[i..]);
            if run >= self.settings.min_table_rows {
                regions.push(table_region(&lines[i..i + run]));
                i += run;
                continue;
            }

            let heading = self.is_heading(&lines[i], median_height);
            let mut end = i + 1;
            while end < lines.len()
                && self.table_run(&lines[end..]) < self.settings.min_table_rows
                && self.is_heading(&lines[end], median_height) == heading
                && lines[end].bbox.y0 - lines[end - 1].bbox.y1
                    <= self.settings.paragraph_gap * median_height
            {
                end += 1;
            }
            regions.push(block_region(&lines[i..end], heading));
            i = end;
        }

        regions
    }

    fn lines<'a>(&self, cells: &'a [TextCell]) -> Vec<Line<'a>> {
        let mut rows: Vec<Vec<&'a TextCell>> = Vec::new();
        for cell in cells {
            let row = rows.iter().position(|row| {
                row.first().is_some_and(|first| {
                    (cell.bbox.center_y() - first.bbox.center_y()).abs() <= self.settings.row_tolerance
                })
            });
            match row {
                Some(pos) => rows[pos].push(cell),
                None => rows.push(vec![cell]),
            }
        }

        let mut lines: Vec<Line<'a>> = rows
            .into_iter()
            .filter_map(|mut row| {
                row.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
                let bbox = BoundingBox::enclosing(row.iter().map(|c| &c.bbox))?;
                let mut columns: Vec<Vec<&TextCell>> = Vec::new();
                for cell in row {
                    match columns.last_mut() {
                        Some(col)
                            if col.last().is_some_and(|prev| {
                                cell.bbox.x0 - prev.bbox.x1 <= self.settings.column_gap
                            }) =>
                        {
                            col.push(cell)
                        }
                        _ => columns.push(vec![cell]),
                    }
                }
                Some(Line { columns, bbox })
            })
            .collect();

        lines.sort_by(|a, b| a.bbox.y0.total_cmp(&b.bbox.y0));
        lines
    }

    /// Number of leading lines that form a table.
    fn table_run(&self, lines: &[Line<'_>]) -> usize {
        let Some(first) = lines.first() else {
            return 0;
        };
        let cols = first.columns.len();
        if cols < self.settings.min_table_cols {
            return 0;
        }
        lines
            .iter()
            .take_while(|l| {
                l.columns.len() >= self.settings.min_table_cols && l.columns.len().abs_diff(cols) <= 1
            })
            .count()
    }

    fn is_heading(&self, line: &Line<'_>, median_height: f32) -> bool {
        median_height > 0.0 && line.bbox.height() >= self.settings.heading_ratio * median_height
    }
}

fn median(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f32::total_cmp);
    values[values.len() / 2]
}

fn table_region(lines: &[Line<'_>]) -> Region {
    let cells = owned_cells(lines);
    let bbox = BoundingBox::enclosing(lines.iter().map(|l| &l.bbox))
        .unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0));
    let text = lines
        .iter()
        .map(|l| {
            l.columns
                .iter()
                .map(|col| join_cells(col))
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .collect::<Vec<_>>()
        .join("\n");
    Region::new(RegionKind::Table, bbox, Some(text), Provenance::Layout).with_cells(cells)
}

fn block_region(lines: &[Line<'_>], heading: bool) -> Region {
    let cells = owned_cells(lines);
    let bbox = BoundingBox::enclosing(lines.iter().map(|l| &l.bbox))
        .unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0));
    let text = lines.iter().map(Line::text).collect::<Vec<_>>().join(" ");
    let kind = if heading {
        RegionKind::Heading
    } else {
        RegionKind::Text
    };
    Region::new(kind, bbox, Some(text), Provenance::Layout).with_cells(cells)
}

impl StageBackend for TextLayerLayout {
    fn name(&self) -> &str {
        "text-layer-layout"
    }

    fn process_batch(&self, items: Vec<StageItem>) -> BoxFuture<'_, Result<Vec<ItemResult>, StageError>> {
        Box::pin(async move { Ok(items.iter().map(|item| Ok(self.analyze(item))).collect()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::sync::Arc;

    fn cell(text: &str, x0: f32, y0: f32, x1: f32, y1: f32) -> TextCell {
        TextCell::new(text, BoundingBox::new(x0, y0, x1, y1))
    }

    fn item(cells: Vec<TextCell>) -> StageItem {
        StageItem {
            page: 1,
            width: 612.0,
            height: 792.0,
            image: Some(Arc::new(DynamicImage::new_rgb8(1, 1))),
            text_cells: cells.into(),
            regions: Vec::new(),
        }
    }

    #[test]
    fn empty_page_is_one_figure() {
        let regions = TextLayerLayout::default().analyze(&item(Vec::new()));
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].kind, RegionKind::Figure);
        assert!(!regions[0].has_text());
    }

    #[test]
    fn close_lines_merge_into_paragraph() {
        let regions = TextLayerLayout::default().analyze(&item(vec![
            cell("Hello", 72.0, 100.0, 110.0, 110.0),
            cell("world.", 114.0, 100.0, 150.0, 110.0),
            cell("Second line.", 72.0, 112.0, 150.0, 122.0),
            cell("Far away.", 72.0, 300.0, 150.0, 310.0),
        ]));
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].text.as_deref(), Some("Hello world. Second line."));
        assert_eq!(regions[1].text.as_deref(), Some("Far away."));
        assert!(regions.iter().all(|r| r.kind == RegionKind::Text));
    }

    #[test]
    fn tall_line_is_heading() {
        let regions = TextLayerLayout::default().analyze(&item(vec![
            cell("Title", 72.0, 50.0, 200.0, 74.0),
            cell("Body one.", 72.0, 100.0, 150.0, 110.0),
            cell("Body two.", 72.0, 112.0, 150.0, 122.0),
            cell("Body three.", 72.0, 124.0, 150.0, 134.0),
        ]));
        assert_eq!(regions[0].kind, RegionKind::Heading);
        assert_eq!(regions[0].text.as_deref(), Some("Title"));
        assert_eq!(regions[1].kind, RegionKind::Text);
    }

    #[test]
    fn aligned_columns_become_table() {
        let regions = TextLayerLayout::default().analyze(&item(vec![
            cell("Intro text.", 72.0, 60.0, 200.0, 70.0),
            cell("Name", 72.0, 100.0, 110.0, 110.0),
            cell("Qty", 200.0, 100.0, 230.0, 110.0),
            cell("Apple", 72.0, 114.0, 110.0, 124.0),
            cell("3", 200.0, 114.0, 206.0, 124.0),
            cell("Pear", 72.0, 128.0, 104.0, 138.0),
            cell("5", 200.0, 128.0, 206.0, 138.0),
        ]));
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].kind, RegionKind::Text);
        let table = &regions[1];
        assert_eq!(table.kind, RegionKind::Table);
        assert_eq!(table.cells.len(), 6);
        assert!(table.cells.iter().all(|c| table.bbox.contains(&c.bbox)));
    }

    #[tokio::test]
    async fn batch_returns_one_result_per_item() {
        let backend = TextLayerLayout::default();
        let items = vec![item(Vec::new()), item(vec![cell("x", 1.0, 1.0, 5.0, 5.0)])];
        let results = backend.process_batch(items).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
