//! Prompts for AI-based print-layout repair.
//!
//! The repair stage asks a model to rewrite a document's HTML/CSS so that it
//! prints cleanly. Keeping the prompt here lets tests inspect it and lets
//! operators diff prompt changes without touching retry logic in
//! [`crate::pipeline::repair`].

use crate::config::PdfOptions;

/// System prompt for the layout-repair call.
pub const LAYOUT_REPAIR_PROMPT: &str = r#"You are an expert in print CSS. You receive an HTML document that will be printed to PDF by headless Chromium. Fix layout problems that appear when the page is printed, without changing its content.

Follow these rules precisely:

1. CONTENT PRESERVATION
   - Keep ALL text, links, images, and data exactly as they are
   - Do not translate, summarise, reorder, or add content
   - Keep every existing <script> element unchanged

2. PAGINATION
   - Prevent rows, figures, headings and short blocks from splitting across pages
     (break-inside: avoid; break-after: avoid on headings)
   - Repeat table headers on each page (thead { display: table-header-group })
   - Remove forced page breaks that leave near-empty pages

3. OVERFLOW
   - Nothing may be wider than the printable area: constrain images, tables,
     pre/code blocks and fixed-width containers (max-width: 100%, wrapping)
   - Replace viewport-height layouts (100vh, position: fixed footers) with flow layout

4. PRINT STYLES
   - Put fixes in a <style> element with an @media print block in <head>
   - Preserve background colours that carry meaning (print-color-adjust: exact)
   - Do not set @page size or margins; the caller controls paper and margins

5. OUTPUT FORMAT
   - Output ONLY the complete corrected HTML document, from <!DOCTYPE html> to </html>
   - Do NOT wrap in ```html fences
   - Do NOT add commentary or explanations"#;

/// Build the user message carrying the document and the paper it targets.
pub fn layout_repair_request(html: &str, options: &PdfOptions) -> String {
    let (w, h) = options
        .paper_size_inches()
        .unwrap_or_else(|_| options.format.dimensions_inches());
    let (w, h) = if options.landscape { (h, w) } else { (w, h) };
    format!(
        "Target paper: {:.2}in × {:.2}in ({}{}), scale {}.\n\nDocument:\n\n{}",
        w,
        h,
        if options.width.is_some() {
            "custom".to_string()
        } else {
            format!("{:?}", options.format)
        },
        if options.landscape { ", landscape" } else { "" },
        options.scale,
        html
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperFormat;

    #[test]
    fn prompt_forbids_fences() {
        assert!(LAYOUT_REPAIR_PROMPT.contains("Do NOT wrap in ```html fences"));
    }

    #[test]
    fn request_swaps_dimensions_for_landscape() {
        let options = PdfOptions {
            format: PaperFormat::Letter,
            landscape: true,
            ..Default::default()
        };
        let msg = layout_repair_request("<html></html>", &options);
        assert!(msg.starts_with("Target paper: 11.00in × 8.50in (Letter, landscape)"));
        assert!(msg.ends_with("<html></html>"));
    }
}
