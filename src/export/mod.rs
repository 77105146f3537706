//! Exporters: Markdown text, page images and the response packages built
//! from them.
//!
//! ```text
//! Document ──▶ markdown ──▶ {content}
//!    │
//!    ├─────▶ image ─────▶ JPEG / PNG / base64
//!    │
//!    └─────▶ package ───▶ JSON aggregate │ ZIP archive │ directory on disk
//! ```

pub mod image;
pub mod markdown;
pub mod package;
