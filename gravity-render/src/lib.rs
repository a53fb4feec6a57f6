use gravity_core::NormalizedRect;

#[cfg(feature = "pdf")]
mod pdfium;

#[cfg(feature = "pdf")]
pub use pdfium::PdfiumTextSource;

pub const PDF_MIME_TYPE: &str = "application/pdf";

/// Guesses a mime type from the file extension.
pub fn mime_type_for_name(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => PDF_MIME_TYPE,
        "txt" => "text/plain",
        "epub" => "application/epub+zip",
        _ => "application/octet-stream",
    }
}

/// Converts a rectangle in PDF user space (origin bottom-left) into page
/// fractions with the origin top-left.
pub fn normalize_bounds(
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
    page_width: f32,
    page_height: f32,
) -> Option<NormalizedRect> {
    if page_width <= 0.0 || page_height <= 0.0 {
        return None;
    }
    let rect = NormalizedRect {
        left: left / page_width,
        top: 1.0 - top / page_height,
        right: right / page_width,
        bottom: 1.0 - bottom / page_height,
    }
    .clamp();
    rect.is_valid().then_some(rect)
}

/// Joins per-page fragment texts the way summaries expect them: fragments
/// separated by a space, every page terminated by a newline.
pub fn join_document_text<P, F>(pages: P) -> String
where
    P: IntoIterator<Item = F>,
    F: IntoIterator,
    F::Item: AsRef<str>,
{
    let mut text = String::new();
    for page in pages {
        let mut first = true;
        for fragment in page {
            if !first {
                text.push(' ');
            }
            text.push_str(fragment.as_ref());
            first = false;
        }
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(mime_type_for_name("Paper.PDF"), PDF_MIME_TYPE);
        assert_eq!(mime_type_for_name("notes.txt"), "text/plain");
        assert_eq!(mime_type_for_name("README"), "application/octet-stream");
    }

    #[test]
    fn bounds_are_flipped_to_top_left_origin() {
        let rect = normalize_bounds(61.2, 712.8, 306.0, 633.6, 612.0, 792.0).unwrap();
        assert!((rect.left - 0.1).abs() < 1e-5);
        assert!((rect.top - 0.1).abs() < 1e-5);
        assert!((rect.right - 0.5).abs() < 1e-5);
        assert!((rect.bottom - 0.2).abs() < 1e-5);
    }

    #[test]
    fn degenerate_bounds_are_rejected() {
        assert!(normalize_bounds(10.0, 10.0, 10.0, 5.0, 100.0, 100.0).is_none());
        assert!(normalize_bounds(0.0, 10.0, 5.0, 0.0, 0.0, 100.0).is_none());
    }

    #[test]
    fn document_text_joins_fragments_and_pages() {
        let pages = vec![vec!["Title", "first line"], vec![], vec!["last"]];
        assert_eq!(join_document_text(pages), "Title first line\n\nlast\n");
    }
}
