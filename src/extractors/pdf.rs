// src/extractors/pdf.rs
use crate::utils::error::ExtractError;

const PDF_MAGIC: &[u8] = b"%PDF";
// Some servers prepend a BOM or whitespace before the header.
const MAGIC_SEARCH_WINDOW: usize = 1024;

fn has_pdf_magic(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(MAGIC_SEARCH_WINDOW)];
    window.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC)
}

/// Joins pages with a single newline and trims the result.
fn normalize(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .split('\x0C')
        .map(|page| page.trim_matches(|c: char| c == '\n' || c == '\r'))
        .collect::<Vec<_>>()
        .join("\n")
        .replace('\u{0}', "")
        .trim()
        .to_string()
}

/// Extracts the text of every page of a PDF held in memory.
pub fn pdf_to_text_blocking(bytes: &[u8]) -> Result<String, ExtractError> {
    if !has_pdf_magic(bytes) {
        return Err(ExtractError::NotPdf(bytes.len()));
    }
    let raw = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let text = normalize(&raw);
    tracing::debug!("Extracted {} chars from {} byte PDF", text.len(), bytes.len());
    Ok(text)
}

/// Runs extraction on the blocking pool. A panic inside the PDF parser is
/// reported as an extraction error.
pub async fn pdf_to_text(bytes: Vec<u8>) -> Result<String, ExtractError> {
    tokio::task::spawn_blocking(move || pdf_to_text_blocking(&bytes))
        .await
        .map_err(|e| ExtractError::Pdf(format!("extractor aborted: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_pdf() {
        let html = b"<!DOCTYPE html><html><body>Please log in</body></html>";
        assert!(matches!(pdf_to_text_blocking(html), Err(ExtractError::NotPdf(n)) if n == html.len()));
        assert!(matches!(pdf_to_text_blocking(b""), Err(ExtractError::NotPdf(0))));
    }

    #[test]
    fn test_magic_after_leading_bytes() {
        assert!(has_pdf_magic(b"\xEF\xBB\xBF%PDF-1.7\n"));
        assert!(!has_pdf_magic(b"PDF-1.7"));
    }

    #[test]
    fn test_normalize_pages() {
        let raw = "\n\nFirst page\nline two\n\n\x0C\nSecond page\n\x0C\n";
        assert_eq!(normalize(raw), "First page\nline two\nSecond page");
    }

    #[tokio::test]
    async fn test_extracts_fixture_text() {
        let bytes = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/quarterly.pdf"));
        let text = tokio_test::assert_ok!(pdf_to_text(bytes.to_vec()).await);
        assert!(text.contains("Quarterly earnings call"), "got {:?}", text);
        assert_eq!(text, text.trim());
    }

    #[tokio::test]
    async fn test_truncated_pdf_is_an_error() {
        let result = pdf_to_text(b"%PDF-1.4\n1 0 obj\n<<".to_vec()).await;
        assert!(matches!(result, Err(ExtractError::Pdf(_))));
    }
}
