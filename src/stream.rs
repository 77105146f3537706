//! Streaming API: pages in document order, as soon as each one is ready.
//!
//! The scheduler finishes pages in any order; the stream waits on the next
//! selected index, so page 3 is only yielded after pages 1 and 2 even if it
//! finished first. Pages that are already assembled are yielded without
//! waiting. The stream ends after the last page, or after the first error
//! (a fatal stage failure or cancellation), which it yields.

use crate::convert::Converter;
use crate::error::ConvertError;
use crate::model::Page;
use crate::pipeline::input::{self, InputDocument};
use crate::pipeline::scheduler::Conversion;
use futures::stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of assembled pages.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<Page, ConvertError>> + Send>>;

/// In-order pages of a running conversion.
///
/// Keep another handle to `conversion` to cancel it while streaming.
pub fn page_stream(conversion: Arc<Conversion>) -> PageStream {
    Box::pin(stream::unfold(
        (conversion, 0usize, false),
        |(conversion, next, stopped)| async move {
            if stopped {
                return None;
            }
            let index = *conversion.selected_pages().get(next)?;
            match conversion.page(index).await {
                Ok(page) => Some((Ok(page), (conversion, next + 1, false))),
                Err(e) => Some((Err(e), (conversion, next + 1, true))),
            }
        },
    ))
}

/// Start converting a path or URL and stream its pages.
pub async fn convert_stream(
    converter: &Converter,
    input: impl AsRef<str>,
) -> Result<PageStream, ConvertError> {
    let input = input.as_ref();
    info!("Starting streaming conversion: {}", input);
    let InputDocument { name, bytes } =
        input::load_input(input, converter.config().download_timeout_secs).await?;
    let conversion = converter.start(&name, bytes).await?;
    Ok(page_stream(Arc::new(conversion)))
}
