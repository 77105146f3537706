//! Page assembler: the reorder buffer between the stages and the exporter.
//!
//! Pages leave the stages in completion order. The assembler keeps one slot
//! per selected page, indexed by position in the selection, plus a watermark:
//! the first slot that is still empty. Everything before the watermark is a
//! contiguous, final prefix of the document and can be streamed out.
//!
//! The buffer is sized by the known page count, so it never grows.

use crate::error::ConvertError;
use crate::model::{Document, DocumentMetadata, Page};
use tracing::debug;

/// Fixed-size reorder buffer keyed by page index.
#[derive(Debug)]
pub struct PageAssembler {
    /// Selected page indices, ascending.
    expected: Vec<usize>,
    slots: Vec<Option<Page>>,
    filled: usize,
    /// Position of the first empty slot.
    watermark: usize,
}

impl PageAssembler {
    /// `expected` must be the ascending, deduplicated page selection.
    pub fn new(expected: Vec<usize>) -> Self {
        let slots = (0..expected.len()).map(|_| None).collect();
        Self {
            expected,
            slots,
            filled: 0,
            watermark: 0,
        }
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.expected.binary_search(&index).ok()
    }

    /// Store a finished (or faulted) page.
    pub fn insert(&mut self, page: Page) -> Result<(), ConvertError> {
        let index = page.index;
        let pos = self.position(index).ok_or_else(|| {
            ConvertError::Internal(format!("page {index} is not part of this conversion"))
        })?;
        if self.slots[pos].is_some() {
            return Err(ConvertError::Internal(format!(
                "page {index} was assembled twice"
            )));
        }
        self.slots[pos] = Some(page);
        self.filled += 1;
        while self.watermark < self.slots.len() && self.slots[self.watermark].is_some() {
            self.watermark += 1;
        }
        debug!(
            "Assembled page {} ({}/{}, watermark at {:?})",
            index,
            self.filled,
            self.slots.len(),
            self.watermark()
        );
        Ok(())
    }

    /// A single page, without waiting for the rest.
    pub fn get(&self, index: usize) -> Option<&Page> {
        self.position(index).and_then(|pos| self.slots[pos].as_ref())
    }

    /// Whether `index` belongs to this conversion.
    pub fn expects(&self, index: usize) -> bool {
        self.position(index).is_some()
    }

    /// Lowest page index that is not yet part of the contiguous prefix,
    /// or `None` once every page has arrived.
    pub fn watermark(&self) -> Option<usize> {
        self.expected.get(self.watermark).copied()
    }

    /// The contiguous, final prefix of pages in ascending order.
    pub fn ready(&self) -> impl Iterator<Item = &Page> {
        self.slots[..self.watermark].iter().flatten()
    }

    pub fn expected(&self) -> &[usize] {
        &self.expected
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// Emit the document once every selected page has a slot.
    ///
    /// A document whose pages all failed to decode, or that has no pages at
    /// all, is [`ConvertError::DocumentUnreadable`].
    pub fn into_document(
        self,
        name: &str,
        total_pages: usize,
        metadata: Option<DocumentMetadata>,
    ) -> Result<Document, ConvertError> {
        if self.expected.is_empty() {
            return Err(ConvertError::DocumentUnreadable {
                name: name.to_string(),
                reason: "document has no pages to convert".into(),
            });
        }
        if let Some(missing) = self.watermark() {
            return Err(ConvertError::Internal(format!(
                "page {missing} never reached the assembler"
            )));
        }
        let pages: Vec<Page> = self.slots.into_iter().flatten().collect();
        if pages.iter().all(Page::decode_failed) {
            return Err(ConvertError::DocumentUnreadable {
                name: name.to_string(),
                reason: format!("none of the {} pages could be decoded", pages.len()),
            });
        }
        Ok(Document {
            name: name.to_string(),
            total_pages,
            pages,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageFault;

    fn page(index: usize) -> Page {
        Page {
            index,
            width: 612.0,
            height: 792.0,
            image: None,
            regions: Vec::new(),
            markdown: format!("page {index}"),
            faults: Vec::new(),
        }
    }

    fn bad(index: usize) -> Page {
        Page::faulted(
            index,
            PageFault::Decode {
                page: index,
                detail: "broken".into(),
            },
        )
    }

    #[test]
    fn watermark_tracks_contiguous_prefix() {
        let mut asm = PageAssembler::new(vec![1, 2, 3, 4]);
        asm.insert(page(3)).unwrap();
        assert_eq!(asm.watermark(), Some(1));
        assert_eq!(asm.ready().count(), 0);
        asm.insert(page(1)).unwrap();
        asm.insert(page(2)).unwrap();
        assert_eq!(asm.watermark(), Some(4));
        let ready: Vec<usize> = asm.ready().map(|p| p.index).collect();
        assert_eq!(ready, vec![1, 2, 3]);
        assert!(!asm.is_complete());
        asm.insert(page(4)).unwrap();
        assert!(asm.is_complete());
        assert_eq!(asm.watermark(), None);
    }

    #[test]
    fn get_answers_without_waiting_for_the_rest() {
        let mut asm = PageAssembler::new(vec![2, 5, 9]);
        asm.insert(page(9)).unwrap();
        assert_eq!(asm.get(9).map(|p| p.index), Some(9));
        assert!(asm.get(5).is_none());
        assert!(!asm.expects(3));
    }

    #[test]
    fn duplicate_and_unknown_pages_are_rejected() {
        let mut asm = PageAssembler::new(vec![1, 2]);
        asm.insert(page(1)).unwrap();
        assert!(asm.insert(page(1)).is_err());
        assert!(asm.insert(page(7)).is_err());
    }

    #[test]
    fn document_is_in_ascending_order() {
        let mut asm = PageAssembler::new(vec![1, 2, 3]);
        for i in [2, 3, 1] {
            asm.insert(page(i)).unwrap();
        }
        let doc = asm.into_document("a.pdf", 3, None).unwrap();
        let order: Vec<usize> = doc.pages.iter().map(|p| p.index).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn all_decode_failures_make_document_unreadable() {
        let mut asm = PageAssembler::new(vec![1, 2]);
        asm.insert(bad(1)).unwrap();
        asm.insert(bad(2)).unwrap();
        let err = asm.into_document("scan.pdf", 2, None).unwrap_err();
        assert!(matches!(err, ConvertError::DocumentUnreadable { .. }));
    }

    #[test]
    fn one_decode_failure_keeps_the_rest() {
        let mut asm = PageAssembler::new(vec![1, 2, 3]);
        asm.insert(page(1)).unwrap();
        asm.insert(bad(2)).unwrap();
        asm.insert(page(3)).unwrap();
        let doc = asm.into_document("a.pdf", 3, None).unwrap();
        assert_eq!(doc.pages.len(), 3);
        assert_eq!(doc.faulted_pages().count(), 1);
    }

    #[test]
    fn empty_selection_is_unreadable() {
        let asm = PageAssembler::new(Vec::new());
        assert!(matches!(
            asm.into_document("empty.pdf", 0, None),
            Err(ConvertError::DocumentUnreadable { .. })
        ));
    }

    #[test]
    fn incomplete_document_is_an_error() {
        let mut asm = PageAssembler::new(vec![1, 2]);
        asm.insert(page(1)).unwrap();
        assert!(matches!(
            asm.into_document("a.pdf", 2, None),
            Err(ConvertError::Internal(_))
        ));
    }
}
