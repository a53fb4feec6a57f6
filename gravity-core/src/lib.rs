pub mod config;
pub mod highlight;
pub mod library;
pub mod orchestrator;
pub mod text;

pub use config::ReaderConfig;
pub use highlight::{apply_highlights, HighlightSurface, HighlightTarget};
pub use library::{
    by_recency, DocumentKey, DocumentRecord, DocumentSummary, FileLibraryStore, LibraryError,
    LibraryStore, MemoryLibraryStore,
};
pub use orchestrator::{
    clamp_scale, AlignmentOrchestrator, AlignmentPhase, PageSurface, RenderEvent, ViewState,
    ViewStateWriter,
};
pub use text::{locate, normalize, FragmentSpan, MatchSpan, PageTextIndex, TextFragment};

/// Position of a fragment on its page, as fractions of the page size with
/// the origin in the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl NormalizedRect {
    pub fn clamp(self) -> Self {
        Self {
            left: self.left.clamp(0.0, 1.0),
            top: self.top.clamp(0.0, 1.0),
            right: self.right.clamp(0.0, 1.0),
            bottom: self.bottom.clamp(0.0, 1.0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }
}

/// Handle of a fragment produced from a document page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FragmentHandle {
    /// 1-based page number.
    pub page: u32,
    /// Position of the fragment in reading order.
    pub ordinal: usize,
    pub bounds: NormalizedRect,
}

/// Clamps a 1-based page number to `1..=page_count`.
pub fn clamp_page(page: u32, page_count: u32) -> u32 {
    page.clamp(1, page_count.max(1))
}
