//! The staged conversion pipeline.
//!
//! Pages flow through bounded queues from the rasterizer to the assembler,
//! visiting only the stages that apply to them:
//!
//! ```text
//!              ┌──────────┐   ┌──────────┐   ┌────────────────┐
//! rasterize ──▶│  layout  │──▶│   ocr    │──▶│ table_structure│──▶ assembler
//! (pdfium)     └──────────┘   └──────────┘   └────────────────┘
//!                    │   skipped when not needed   ▲    │
//!                    └─────────────────────────────┘    ▼
//!                                                    assembler
//! ```
//!
//! 1. [`input`] — read a local path or URL into memory
//! 2. [`rasterize`] — render selected pages and their text layer; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`scheduler`] — batch pages per stage, bound concurrency, route each
//!    page to its next applicable stage
//! 4. [`layout`], [`ocr`], [`table`] — the default [`stage::StageBackend`]s
//! 5. [`assembler`] — collect finished pages in document order
//!
//! [`accelerator`] serialises batches on shared devices and
//! [`postprocess`] cleans OCR Markdown before it becomes regions.

pub mod accelerator;
pub mod assembler;
pub mod input;
pub mod layout;
pub mod ocr;
pub mod postprocess;
pub mod rasterize;
pub mod scheduler;
pub mod stage;
pub mod table;
