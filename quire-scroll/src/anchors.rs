//! Source-line anchors of the rendered preview.
//!
//! Each rendered block records the markdown line it came from and its
//! pixel offset from the top of the preview's scroll content. The map is
//! rebuilt once per content or layout change and queried on every scroll.
//!
//! ```text
//!  line │ offset
//! ──────┼────────
//!     1 │    0      ◄── line_at_offset(130) = 5
//!     5 │  120      ◄── anchor_for_line(7)  = 5
//!    10 │  300
//! ```

/// One `(line, offset)` pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    pub line: u32,
    pub offset: f32,
}

/// Parse a block's source-line attribute.
///
/// Accepts a plain line number (`data-line="12"`) or a source position
/// range (`data-sourcepos="12:1-14:3"`), returning the start line. Anything
/// malformed yields `None`.
pub fn parse_source_line(attr: &str) -> Option<u32> {
    let attr = attr.trim();
    if !attr.contains(':') {
        return attr.parse().ok();
    }
    let (start, end) = attr.split_once('-')?;
    let (line, column) = start.split_once(':')?;
    let (end_line, end_column) = end.split_once(':')?;
    for part in [column, end_line, end_column] {
        part.parse::<u32>().ok()?;
    }
    line.parse().ok()
}

/// Sorted anchors, one per line, with non-decreasing offsets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnchorMap {
    anchors: Vec<Anchor>,
}

impl AnchorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(line, offset)` pairs in document order.
    ///
    /// When several blocks claim the same line the first one wins. Anchors
    /// whose offset lies above an earlier line's offset (floated or
    /// absolutely positioned blocks) are dropped so both lookups stay
    /// monotonic.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, f32)>,
    {
        let mut anchors: Vec<Anchor> = pairs
            .into_iter()
            .filter(|(_, offset)| offset.is_finite())
            .map(|(line, offset)| Anchor { line, offset })
            .collect();
        // Stable, so the first block for a line stays first.
        anchors.sort_by_key(|a| a.line);
        anchors.dedup_by_key(|a| a.line);

        let mut monotonic: Vec<Anchor> = Vec::with_capacity(anchors.len());
        for anchor in anchors {
            if monotonic.last().is_some_and(|prev| anchor.offset < prev.offset) {
                log::trace!("Dropping out-of-order anchor for line {}", anchor.line);
                continue;
            }
            monotonic.push(anchor);
        }
        Self { anchors: monotonic }
    }

    /// Build from `(source-line attribute, offset)` pairs, skipping blocks
    /// whose attribute does not parse.
    pub fn from_blocks<'a, I>(blocks: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f32)>,
    {
        Self::from_pairs(
            blocks
                .into_iter()
                .filter_map(|(attr, offset)| parse_source_line(attr).map(|line| (line, offset))),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    /// Greatest line whose offset is at or above `offset`.
    pub fn line_at_offset(&self, offset: f32) -> Option<u32> {
        let idx = self.anchors.partition_point(|a| a.offset <= offset);
        idx.checked_sub(1).map(|i| self.anchors[i].line)
    }

    /// Greatest anchor whose line is `<= line`.
    pub fn anchor_for_line(&self, line: u32) -> Option<Anchor> {
        let idx = self.anchors.partition_point(|a| a.line <= line);
        idx.checked_sub(1).map(|i| self.anchors[i])
    }

    /// Scroll offset bringing `line`'s anchor to the top of the viewport,
    /// `margin` pixels short of it, clamped to `[0, max_scroll]`.
    pub fn offset_for_line(&self, line: u32, margin: f32, max_scroll: f32) -> Option<f32> {
        let anchor = self.anchor_for_line(line)?;
        Some((anchor.offset - margin).clamp(0.0, max_scroll.max(0.0)))
    }
}
