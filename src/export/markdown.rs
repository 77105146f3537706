//! Markdown export for pages and documents.
//!
//! Regions render in reading order, separated by blank lines. Tables with a
//! recognised structure become GFM tables whose first row is the header;
//! figures become an `<!-- image -->` placeholder. Every fault recorded on a
//! page is rendered as an HTML comment, so a faulted page is never silently
//! empty.

use crate::config::PageSeparator;
use crate::model::{BoundingBox, Document, Page, Region, RegionKind, TableCell, TableStructure};

/// Markdown for one page.
pub fn page_markdown(page: &Page) -> String {
    let mut blocks: Vec<String> = page.regions.iter().filter_map(region_markdown).collect();
    blocks.extend(page.faults.iter().map(|f| fault_marker(&f.to_string())));
    blocks.join("\n\n")
}

/// Markdown for one region, or `None` when it carries nothing to show.
pub fn region_markdown(region: &Region) -> Option<String> {
    match region.kind {
        RegionKind::Figure => Some("<!-- image -->".to_string()),
        RegionKind::Table => match &region.table {
            Some(table) if table.num_rows > 0 && table.num_cols > 0 => Some(table_markdown(table)),
            _ => non_empty(region.text.as_deref()),
        },
        RegionKind::Heading => non_empty(region.text.as_deref()).map(|t| format!("## {t}")),
        RegionKind::Text => non_empty(region.text.as_deref()),
    }
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string)
}

fn fault_marker(detail: &str) -> String {
    let mut detail = detail.replace('\n', " ");
    while detail.contains("--") {
        detail = detail.replace("--", "- -");
    }
    format!("<!-- fault: {detail} -->")
}

fn escape_cell(text: &str) -> String {
    text.replace('\n', " ").replace('|', "\\|")
}

fn table_row(cells: &[String]) -> String {
    let escaped: Vec<String> = cells.iter().map(|c| escape_cell(c)).collect();
    format!("| {} |", escaped.join(" | "))
}

/// GFM table for a recognised structure; the first row is the header.
pub fn table_markdown(table: &TableStructure) -> String {
    let grid = table.grid();
    let mut lines = Vec::with_capacity(grid.len() + 1);
    for (i, row) in grid.iter().enumerate() {
        lines.push(table_row(row));
        if i == 0 {
            lines.push(format!("|{}", " --- |".repeat(table.num_cols)));
        }
    }
    lines.join("\n")
}

/// Every page in ascending order, joined with `separator`.
pub fn document_markdown(doc: &Document, separator: &PageSeparator) -> String {
    let mut out = String::new();
    for (i, page) in doc.pages.iter().enumerate() {
        if i > 0 {
            out.push_str(&separator.render(page.index));
        }
        out.push_str(page.markdown.trim());
    }
    let trimmed = out.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

fn split_row(line: &str) -> Vec<String> {
    let inner = line.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => cells.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

fn is_separator(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Rows of one GFM table block. The separator is only recognised as the
/// block's second line.
fn table_rows(block: &str) -> Vec<Vec<String>> {
    block
        .lines()
        .enumerate()
        .filter(|(i, line)| !(*i == 1 && is_separator(line)))
        .map(|(_, line)| split_row(line))
        .collect()
}

/// Parse a GFM table block into a structure. Every cell gets `bbox`, since
/// Markdown carries no geometry.
pub fn parse_table(block: &str, bbox: BoundingBox) -> Option<TableStructure> {
    let rows = table_rows(block);
    let num_cols = rows.iter().map(Vec::len).max()?;
    let cells = rows
        .iter()
        .enumerate()
        .flat_map(|(row, cols)| {
            cols.iter().enumerate().map(move |(col, text)| TableCell {
                row,
                col,
                text: text.clone(),
                bbox,
            })
        })
        .collect();
    Some(TableStructure {
        num_rows: rows.len(),
        num_cols,
        cells,
    })
}

/// Every table in a Markdown text, as row-major cell text.
pub fn parse_markdown_tables(markdown: &str) -> Vec<Vec<Vec<String>>> {
    let mut tables = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    for line in markdown.lines().chain(std::iter::once("")) {
        let t = line.trim();
        if t.starts_with('|') && t.ends_with('|') && t.len() > 1 {
            block.push(line);
        } else if !block.is_empty() {
            tables.push(table_rows(&block.join("\n")));
            block.clear();
        }
    }
    tables
}
