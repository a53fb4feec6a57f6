use std::ops::Range;

/// One unit of rendered text together with the handle the renderer uses to
/// address it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFragment<H> {
    pub text: String,
    pub handle: H,
}

impl<H> TextFragment<H> {
    pub fn new(text: impl Into<String>, handle: H) -> Self {
        Self {
            text: text.into(),
            handle,
        }
    }
}

/// Half-open byte range in the non-normalized page text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchSpan {
    pub start: usize,
    pub end: usize,
}

impl MatchSpan {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

#[derive(Debug, Clone)]
pub struct FragmentSpan<H> {
    pub start: usize,
    pub end: usize,
    pub fragment: TextFragment<H>,
}

impl<H> FragmentSpan<H> {
    pub fn intersects(&self, span: MatchSpan) -> bool {
        self.end > span.start && self.start < span.end
    }
}

/// Concatenated text of one rendered page and the range every fragment
/// occupies in it. Ranges are contiguous and `full_text[start..end]` is
/// always the fragment's own text.
#[derive(Debug, Clone)]
pub struct PageTextIndex<H> {
    full_text: String,
    spans: Vec<FragmentSpan<H>>,
}

impl<H> PageTextIndex<H> {
    pub fn build<I>(fragments: I) -> Self
    where
        I: IntoIterator<Item = TextFragment<H>>,
    {
        let mut full_text = String::new();
        let mut spans = Vec::new();
        for fragment in fragments {
            let start = full_text.len();
            full_text.push_str(&fragment.text);
            spans.push(FragmentSpan {
                start,
                end: full_text.len(),
                fragment,
            });
        }
        Self { full_text, spans }
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn spans(&self) -> &[FragmentSpan<H>] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Fragments whose range overlaps `span`, in reading order.
    pub fn fragments_intersecting(&self, span: MatchSpan) -> impl Iterator<Item = &FragmentSpan<H>> {
        let first = self.spans.partition_point(|entry| entry.end <= span.start);
        self.spans[first..]
            .iter()
            .take_while(move |entry| entry.intersects(span))
    }
}

/// Lowercased, whitespace-free view of a string that remembers which
/// original character produced every normalized byte.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    text: String,
    origins: Vec<(usize, usize)>,
}

impl NormalizedText {
    pub fn new(source: &str) -> Self {
        let mut text = String::with_capacity(source.len());
        let mut origins = Vec::with_capacity(source.len());
        for (offset, ch) in source.char_indices() {
            if ch.is_whitespace() {
                continue;
            }
            let origin = (offset, offset + ch.len_utf8());
            for lower in ch.to_lowercase() {
                text.push(lower);
                origins.extend(std::iter::repeat(origin).take(lower.len_utf8()));
            }
        }
        Self { text, origins }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// Maps a normalized byte range back onto the source string.
    pub fn original_range(&self, range: Range<usize>) -> Option<Range<usize>> {
        if range.is_empty() {
            return None;
        }
        let (start, _) = *self.origins.get(range.start)?;
        let (_, end) = *self.origins.get(range.end - 1)?;
        Some(start..end)
    }
}

/// Strips every whitespace character and lowercases the rest.
pub fn normalize(text: &str) -> String {
    NormalizedText::new(text).into_string()
}

/// Finds every occurrence of `target` in the page text, ignoring whitespace
/// and case on both sides.
///
/// Scanning resumes one character past the start of each hit, so repeated
/// short targets may yield overlapping spans. An empty or whitespace-only
/// target matches nothing.
pub fn locate<H>(index: &PageTextIndex<H>, target: &str) -> Vec<MatchSpan> {
    let needle = normalize(target);
    if needle.is_empty() {
        return Vec::new();
    }

    let haystack = NormalizedText::new(index.full_text());
    let text = haystack.as_str();
    let mut spans: Vec<MatchSpan> = Vec::new();
    let mut cursor = 0;

    while cursor < text.len() {
        let Some(found) = text[cursor..].find(needle.as_str()) else {
            break;
        };
        let at = cursor + found;
        if let Some(range) = haystack.original_range(at..at + needle.len()) {
            // one source char can expand to several lowercase chars
            if spans.last().map_or(true, |prev| prev.start < range.start) {
                spans.push(MatchSpan {
                    start: range.start,
                    end: range.end,
                });
            }
        }
        cursor = at + text[at..].chars().next().map_or(1, char::len_utf8);
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(parts: &[&str]) -> PageTextIndex<usize> {
        PageTextIndex::build(
            parts
                .iter()
                .enumerate()
                .map(|(ordinal, text)| TextFragment::new(*text, ordinal)),
        )
    }

    fn ranges(spans: &[MatchSpan]) -> Vec<(usize, usize)> {
        spans.iter().map(|s| (s.start, s.end)).collect()
    }

    #[test]
    fn index_spans_are_contiguous_and_reconstruct_text() {
        let index = index_of(&["The quick ", "", "brown\u{a0}", "fox ", "jümps"]);
        let rebuilt: String = index
            .spans()
            .iter()
            .map(|entry| entry.fragment.text.as_str())
            .collect();
        assert_eq!(rebuilt, index.full_text());

        assert_eq!(index.spans().first().unwrap().start, 0);
        assert_eq!(index.spans().last().unwrap().end, index.full_text().len());
        for pair in index.spans().windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for entry in index.spans() {
            assert_eq!(&index.full_text()[entry.start..entry.end], entry.fragment.text);
        }
    }

    #[test]
    fn empty_page_builds_empty_index() {
        let index = index_of(&[]);
        assert!(index.is_empty());
        assert_eq!(index.full_text(), "");
        assert!(locate(&index, "anything").is_empty());
    }

    #[test]
    fn normalize_strips_whitespace_and_case() {
        assert_eq!(normalize("  Hello\tWorld\n"), "helloworld");
        assert_eq!(normalize(" \n\t "), "");
    }

    #[test]
    fn locate_ignores_internal_whitespace_and_case() {
        let index = index_of(&["Hello   World"]);
        assert_eq!(ranges(&locate(&index, "helloworld")), vec![(0, 13)]);
    }

    #[test]
    fn locate_reports_every_occurrence() {
        let index = index_of(&["catcat"]);
        assert_eq!(ranges(&locate(&index, "cat")), vec![(0, 3), (3, 6)]);
    }

    #[test]
    fn locate_resumes_one_past_previous_start() {
        let index = index_of(&["aaa"]);
        assert_eq!(ranges(&locate(&index, "aa")), vec![(0, 2), (1, 3)]);
    }

    #[test]
    fn locate_is_noop_for_empty_blank_and_missing_targets() {
        let index = index_of(&["Some page text"]);
        assert!(locate(&index, "").is_empty());
        assert!(locate(&index, "   \n\t").is_empty());
        assert!(locate(&index, "absent").is_empty());
    }

    #[test]
    fn locate_target_longer_than_text_finds_nothing() {
        let index = index_of(&["short"]);
        assert!(locate(&index, "short but longer").is_empty());
    }

    #[test]
    fn locate_target_equal_to_text_covers_everything() {
        let index = index_of(&["Line one\n", "line two"]);
        let spans = locate(&index, "Line one\nline two");
        assert_eq!(ranges(&spans), vec![(0, index.full_text().len())]);
    }

    #[test]
    fn locate_excludes_surrounding_whitespace_from_span() {
        let index = index_of(&["  wrapped ", "\n  across lines  "]);
        let spans = locate(&index, "wrapped across");
        assert_eq!(spans.len(), 1);
        assert_eq!(&index.full_text()[spans[0].range()], "wrapped \n  across");
    }

    #[test]
    fn locate_maps_multibyte_characters_to_byte_offsets() {
        let index = index_of(&["ÄPFEL Baum und mehr"]);
        let spans = locate(&index, "äpfelbaum");
        assert_eq!(ranges(&spans), vec![(0, 11)]);
        assert_eq!(&index.full_text()[spans[0].range()], "ÄPFEL Baum");
    }

    #[test]
    fn fragments_intersecting_selects_touched_fragments_only() {
        let index = index_of(&["alpha ", "beta ", "gamma ", "delta"]);
        let spans = locate(&index, "ta gam");
        assert_eq!(spans.len(), 1);
        let touched: Vec<usize> = index
            .fragments_intersecting(spans[0])
            .map(|entry| entry.fragment.handle)
            .collect();
        assert_eq!(touched, vec![1, 2]);
    }

    #[test]
    fn fragments_intersecting_walks_past_empty_fragments() {
        let index = index_of(&["one ", "", "two", " three"]);
        let span = MatchSpan { start: 2, end: 6 };
        let touched: Vec<usize> = index
            .fragments_intersecting(span)
            .map(|entry| entry.fragment.handle)
            .collect();
        assert_eq!(touched, vec![0, 1, 2]);
        assert!(index
            .spans()
            .iter()
            .all(|entry| entry.intersects(span) == touched.contains(&entry.fragment.handle)));
    }
}
