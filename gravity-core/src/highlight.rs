use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::text::{MatchSpan, PageTextIndex};

/// The text the reader wants highlighted and the color to paint it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightTarget {
    pub text: String,
    pub color: String,
}

impl HighlightTarget {
    pub fn new(text: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: color.into(),
        }
    }
}

/// Presentation state of rendered fragments.
///
/// Both methods return `false` when the handle no longer belongs to the live
/// render; callers treat that as a stale index, not as a failure.
pub trait HighlightSurface {
    type Handle;

    fn clear(&mut self, handle: &Self::Handle) -> bool;
    fn paint(&mut self, handle: &Self::Handle, color: &str) -> bool;
}

/// Clears every fragment of the page, then paints each fragment that
/// intersects one of `spans`.
pub fn apply_highlights<S>(
    index: &PageTextIndex<S::Handle>,
    spans: &[MatchSpan],
    color: &str,
    surface: &mut S,
) where
    S: HighlightSurface + ?Sized,
{
    let mut stale = 0usize;
    for entry in index.spans() {
        if !surface.clear(&entry.fragment.handle) {
            stale += 1;
        }
    }

    let mut painted = 0usize;
    for span in spans {
        for entry in index.fragments_intersecting(*span) {
            if surface.paint(&entry.fragment.handle, color) {
                painted += 1;
            } else {
                stale += 1;
            }
        }
    }

    trace!(spans = spans.len(), painted, stale, "applied highlights");
}
