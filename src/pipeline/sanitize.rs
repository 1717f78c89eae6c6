//! Deterministic cleanup of LLM-returned HTML.
//!
//! Even well-prompted models wrap their answer in ` ```html ` fences, prepend
//! a sentence of commentary, or sprinkle zero-width characters. These rules
//! strip that noise so the repaired document can be handed to the browser.
//!
//! ## Rule Order
//!
//! Fences are stripped before the leading-prose pass so the prose detector
//! sees the real first tag; invisible characters go last so earlier regexes
//! do not have to account for them.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to the raw model output.
///
/// 1. Strip outer code fences (` ```html … ``` `)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Drop prose before the first tag / after the closing `</html>`
/// 4. Strip invisible Unicode (zero-width spaces, BOM, …)
pub fn clean_html(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_surrounding_prose(&s);
    remove_invisible_chars(&s)
}

/// Whether the text plausibly is a full HTML document.
///
/// Used to reject repairs where the model answered with an explanation or
/// returned only a fragment of the page.
pub fn looks_like_html_document(input: &str) -> bool {
    let lower = input.to_ascii_lowercase();
    (lower.contains("<html") || lower.contains("<!doctype html"))
        && lower.contains("<body")
        && lower.contains("</html>")
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:html|HTML|xml)?[ \t]*\n(.*)\n```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Drop leading / trailing prose ────────────────────────────────────

static RE_DOC_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<!doctype html|<html").unwrap());

fn trim_surrounding_prose(input: &str) -> String {
    let start = RE_DOC_START.find(input).map(|m| m.start()).unwrap_or(0);
    let body = &input[start..];
    let lower = body.to_ascii_lowercase();
    let end = lower
        .rfind("</html>")
        .map(|i| i + "</html>".len())
        .unwrap_or(body.len());
    let mut out = body[..end].trim().to_string();
    out.push('\n');
    out
}

// ── Rule 4: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "<!DOCTYPE html>\n<html><head></head><body><p>x</p></body></html>";

    #[test]
    fn strips_html_fences() {
        let raw = format!("```html\n{DOC}\n```");
        assert_eq!(clean_html(&raw), format!("{DOC}\n"));
    }

    #[test]
    fn strips_bare_fences() {
        let raw = format!("```\n{DOC}\n```\n");
        assert!(clean_html(&raw).starts_with("<!DOCTYPE html>"));
    }

    #[test]
    fn drops_commentary_around_document() {
        let raw = format!("Here is the fixed page:\n\n{DOC}\n\nI moved the table.");
        let cleaned = clean_html(&raw);
        assert!(cleaned.starts_with("<!DOCTYPE html>"));
        assert!(cleaned.trim_end().ends_with("</html>"));
    }

    #[test]
    fn crlf_and_invisible_chars() {
        let raw = "<html>\r\n<body>\u{200B}x\u{FEFF}</body>\r\n</html>";
        let cleaned = clean_html(raw);
        assert!(!cleaned.contains('\r'));
        assert!(!cleaned.contains('\u{200B}'));
        assert!(cleaned.contains("<body>x</body>"));
    }

    #[test]
    fn document_detection() {
        assert!(looks_like_html_document(DOC));
        assert!(!looks_like_html_document("<p>only a fragment</p>"));
        assert!(!looks_like_html_document(
            "I cannot help with that request."
        ));
    }
}
