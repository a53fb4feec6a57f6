use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use gravity_core::{FragmentHandle, TextFragment};
use pdfium_render::prelude::*;
use tracing::{instrument, warn};

use crate::{join_document_text, normalize_bounds};

pub const PDFIUM_LIBRARY_ENV: &str = "GRAVITY_PDFIUM_LIBRARY_PATH";

/// Produces the text fragments of PDF pages, one fragment per pdfium text
/// segment, in pdfium's reading order.
pub struct PdfiumTextSource {
    pdfium: Arc<Pdfium>,
}

impl PdfiumTextSource {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }

    fn open<'a>(&'a self, bytes: &'a [u8]) -> Result<PdfDocument<'a>> {
        self.pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .context("failed to open PDF document")
    }

    pub fn page_count(&self, bytes: &[u8]) -> Result<u32> {
        let document = self.open(bytes)?;
        Ok(u32::try_from(document.pages().len()).unwrap_or_default())
    }

    /// Fragments of the 1-based `page`.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub fn page_fragments(
        &self,
        bytes: &[u8],
        page: u32,
    ) -> Result<Vec<TextFragment<FragmentHandle>>> {
        let document = self.open(bytes)?;
        page_fragments(&document, page)
    }

    /// Whole-document text for summarization.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub fn document_text(&self, bytes: &[u8]) -> Result<String> {
        let document = self.open(bytes)?;
        let page_count = u32::try_from(document.pages().len()).unwrap_or_default();
        let mut pages = Vec::with_capacity(page_count as usize);
        for page in 1..=page_count {
            let fragments = page_fragments(&document, page)?;
            pages.push(fragments.into_iter().map(|fragment| fragment.text));
        }
        Ok(join_document_text(pages))
    }
}

fn page_fragments(
    document: &PdfDocument<'_>,
    page: u32,
) -> Result<Vec<TextFragment<FragmentHandle>>> {
    let page_index: PdfPageIndex = page
        .checked_sub(1)
        .and_then(|index| PdfPageIndex::try_from(index).ok())
        .ok_or_else(|| anyhow!("page {} is out of supported range", page))?;
    let pdf_page = document
        .pages()
        .get(page_index)
        .with_context(|| format!("page {} out of range", page))?;
    let text = pdf_page
        .text()
        .with_context(|| format!("failed to extract text for page {}", page))?;

    let page_width = pdf_page.width().value;
    let page_height = pdf_page.height().value;

    let mut fragments = Vec::new();
    for segment in text.segments().iter() {
        let content = segment.text();
        if content.is_empty() {
            continue;
        }
        let rect = segment.bounds();
        let Some(bounds) = normalize_bounds(
            rect.left().value,
            rect.top().value,
            rect.right().value,
            rect.bottom().value,
            page_width,
            page_height,
        ) else {
            warn!(page, "skipping text segment without usable bounds");
            continue;
        };
        let ordinal = fragments.len();
        fragments.push(TextFragment::new(
            content,
            FragmentHandle {
                page,
                ordinal,
                bounds,
            },
        ));
    }

    Ok(fragments)
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    let path = std::env::var(PDFIUM_LIBRARY_ENV).ok()?;
    if path.is_empty() {
        return None;
    }
    match Pdfium::bind_to_library(&path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!("failed to load Pdfium from {}: {}", path, err);
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {} or install it ({})",
                PDFIUM_LIBRARY_ENV,
                errors.join(", ")
            ))
        }
    }
}
