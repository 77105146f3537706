//! Deterministic cleanup of OCR Markdown before it is split into regions.
//!
//! Vision models drift from the prompt in small, predictable ways: fenced
//! output, CRLF line endings, a table without its separator row, headings
//! glued to the paragraph above, image links pointing nowhere. Region
//! splitting relies on blank lines between blocks, so every rule here either
//! removes noise or restores that block structure.
//!
//! Rules run in order: fences and line endings first so later rules see
//! plain `\n` text, block spacing before blank-line collapsing.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every cleanup rule to raw OCR output.
///
/// 1. Strip an outer code fence
/// 2. Normalise line endings
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Trim trailing whitespace
/// 5. Drop image links with placeholder targets, keeping the alt text
/// 6. Repair table separator rows
/// 7. Put blank lines around headings and tables
/// 8. Collapse runs of blank lines to one
/// 9. End with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = remove_placeholder_images(&s);
    let s = repair_tables(&s);
    let s = separate_blocks(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\r?\n(.*)\r?\n```$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCE.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}'],
        "",
    )
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

const PLACEHOLDER_HOSTS: [&str; 6] = [
    "example.com",
    "placeholder.com",
    "placehold.it",
    "dummyimage.com",
    "lorempixel.com",
    "picsum.photos",
];

fn is_placeholder_target(url: &str) -> bool {
    let url = url.trim();
    let absolute = url.starts_with("http://") || url.starts_with("https://");
    !absolute || PLACEHOLDER_HOSTS.iter().any(|host| url.contains(host))
}

fn remove_placeholder_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            if !is_placeholder_target(&caps[2]) {
                return caps[0].to_string();
            }
            match caps[1].trim() {
                "" => String::new(),
                alt => format!("*{alt}*"),
            }
        })
        .into_owned()
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 1 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    is_table_row(line)
        && line.contains('-')
        && line.trim().chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn separator_for(header: &str) -> String {
    let cols = header.trim().matches('|').count().saturating_sub(1).max(1);
    let mut row = String::from("|");
    for _ in 0..cols {
        row.push_str(" --- |");
    }
    row
}

/// Each table keeps exactly one separator row, directly under its header.
fn repair_tables(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut position = 0usize;

    for line in input.lines() {
        if !is_table_row(line) {
            position = 0;
            out.push(line.to_string());
            continue;
        }
        position += 1;
        match (position, is_separator_row(line)) {
            (1, true) => position = 0,
            (2, false) => {
                let header = out.last().map(String::as_str).unwrap_or(line);
                out.push(separator_for(header));
                out.push(line.to_string());
                position = 3;
            }
            (2, true) => out.push(line.to_string()),
            (_, true) => {}
            (_, false) => out.push(line.to_string()),
        }
    }

    out.join("\n")
}

/// Blank lines before and after headings, and around table blocks.
fn separate_blocks(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut prev_table = false;
    let mut prev_heading = false;

    for line in input.lines() {
        let heading = line.starts_with('#');
        let table = is_table_row(line);
        let blank = line.is_empty();
        let boundary = !blank
            && out.last().is_some_and(|last| !last.is_empty())
            && (heading || prev_heading || table != prev_table);
        if boundary {
            out.push("");
        }
        out.push(line);
        prev_table = table;
        prev_heading = heading;
    }

    out.join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n").into_owned()
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}
