//! System prompts for the vision-LLM OCR backend.
//!
//! Callers can override the default via
//! [`crate::config::PipelineConfigBuilder::system_prompt`]; the constant here
//! is used only when no override is provided.

/// Default system prompt for transcribing a scanned page image.
///
/// The output is split into regions on blank lines, so the prompt asks for
/// one block per paragraph, heading or table.
pub const OCR_SYSTEM_PROMPT: &str = r#"You are a precise OCR engine. Transcribe the text of the page image as Markdown.

Follow these rules precisely:

1. TEXT
   - Transcribe ALL visible text exactly as printed, in natural reading order
   - Do not summarise, translate or correct wording

2. BLOCKS
   - Separate every paragraph, heading, list and table with one blank line
   - Use ## for headings
   - Keep list items on consecutive lines

3. TABLES
   - Write tables in GFM pipe format with a header separator row
   - Keep empty cells empty

4. WHAT TO IGNORE
   - Page numbers and running headers/footers
   - Figures, logos and decorative elements

5. OUTPUT FORMAT
   - Output ONLY the transcription
   - Do NOT wrap in ```markdown fences
   - If the page has no text, output nothing"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_requests_block_separation() {
        assert!(OCR_SYSTEM_PROMPT.contains("blank line"));
        assert!(OCR_SYSTEM_PROMPT.contains("GFM"));
    }
}
