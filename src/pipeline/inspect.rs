//! Read-only facts about a finished PDF.
//!
//! Credits are charged per page, so [`page_count`] is the single source of
//! truth for billing. It parses the document that will actually be delivered,
//! after every post-processing step.

use crate::error::Html2PdfError;
use lopdf::Document;
use serde::Serialize;

/// Summary of a PDF document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfInfo {
    pub pages: usize,
    pub version: String,
    pub bytes: usize,
}

/// Number of pages in `pdf`. A document without pages is an error.
pub fn page_count(pdf: &[u8]) -> Result<usize, Html2PdfError> {
    inspect(pdf).map(|info| info.pages)
}

/// Parse `pdf` and report its page count and header version.
pub fn inspect(pdf: &[u8]) -> Result<PdfInfo, Html2PdfError> {
    let doc = Document::load_mem(pdf)
        .map_err(|e| Html2PdfError::PostProcessFailed(format!("cannot parse PDF: {e}")))?;
    let pages = doc.get_pages().len();
    if pages == 0 {
        return Err(Html2PdfError::PostProcessFailed(
            "PDF contains no pages".into(),
        ));
    }
    Ok(PdfInfo {
        pages,
        version: doc.version.clone(),
        bytes: pdf.len(),
    })
}
