//! Bidirectional editor ↔ preview scroll reconciliation.
//!
//! ```text
//!                 editor scroll (guard idle)
//!        ┌──────► SyncingFromEditor ──settle──┐
//!        │                                    ▼
//!      Idle ◄─────────────────────────────── Idle
//!        │                                    ▲
//!        └──────► SyncingFromPreview ─settle──┘
//!                 preview scroll (guard idle, user input)
//!
//!   caret newline at end / content change while pinned
//!        * ──────► LockedToBottom ──(lock window elapses)──► Idle
//! ```
//!
//! The reconciler is pure state: hosts feed it measured [`ScrollMetrics`]
//! and the current time and apply the targets it returns. Anchor lines are
//! preferred over fractions whenever the preview provides them.

use std::time::{Duration, Instant};

use crate::anchors::AnchorMap;
use crate::guard::{GuardState, SyncGuard, SyncSource};
use crate::lock::BottomLock;
use crate::metrics::{FractionTracker, ScrollMetrics};

/// Heuristic thresholds. Calibration defaults, not exact contracts.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilerConfig {
    /// Height growth with `scroll_top` moving at most this far counts as
    /// content inserted below the fold
    pub growth_threshold_px: f32,
    /// Distance from the bottom edge still treated as "at bottom"
    pub bottom_tolerance_px: f32,
    /// How long the preview stays pinned to its bottom
    pub lock_duration: Duration,
    /// How recent pointer/wheel input must be for a preview scroll to count
    /// as user driven
    pub interaction_window: Duration,
    /// Gap left above an anchored block when scrolling to it
    pub anchor_margin_px: f32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            growth_threshold_px: 2.0,
            bottom_tolerance_px: 4.0,
            lock_duration: Duration::from_millis(500),
            interaction_window: Duration::from_millis(500),
            anchor_margin_px: 8.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    SyncingFromEditor,
    SyncingFromPreview,
    LockedToBottom,
}

/// Where to move the preview.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PreviewTarget {
    pub scroll_top: f32,
    /// Fraction of the preview's scroll range the target represents.
    pub fraction: f32,
    /// Set when the target came from an anchor rather than a fraction.
    pub anchor_line: Option<u32>,
}

/// Where to move the editor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EditorTarget {
    /// Bring this source line to the top of the editor.
    Line(u32),
    /// Scroll to this pixel offset.
    Offset(f32),
}

pub struct Reconciler {
    config: ReconcilerConfig,
    guard: SyncGuard,
    lock: BottomLock,
    editor: FractionTracker,
    preview: FractionTracker,
    anchors: AnchorMap,
    editor_pinned: bool,
    last_interaction: Option<Instant>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        let lock = BottomLock::new(config.lock_duration);
        Self {
            config,
            guard: SyncGuard::new(),
            lock,
            editor: FractionTracker::new(),
            preview: FractionTracker::new(),
            anchors: AnchorMap::new(),
            editor_pinned: false,
            last_interaction: None,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn anchors(&self) -> &AnchorMap {
        &self.anchors
    }

    pub fn guard_state(&self) -> GuardState {
        self.guard.state()
    }

    pub fn state(&mut self, now: Instant) -> ReconcilerState {
        if self.lock.is_locked(now) {
            return ReconcilerState::LockedToBottom;
        }
        match self.guard.state() {
            GuardState::Idle => ReconcilerState::Idle,
            GuardState::FromEditor => ReconcilerState::SyncingFromEditor,
            GuardState::FromPreview => ReconcilerState::SyncingFromPreview,
        }
    }

    pub fn is_locked(&mut self, now: Instant) -> bool {
        self.lock.is_locked(now)
    }

    /// Release the reentrancy guard. Hosts call this on the tick after
    /// applying a returned target.
    pub fn settle(&mut self) {
        self.guard.settle();
    }

    /// Record pointer or wheel input on the preview. The user taking over
    /// the preview releases a bottom lock.
    pub fn note_preview_interaction(&mut self, now: Instant) {
        self.last_interaction = Some(now);
        self.lock.release();
    }

    /// The editor scrolled. Returns the preview target, or `None` when a
    /// sync is already in flight.
    pub fn on_editor_scroll(
        &mut self,
        editor: ScrollMetrics,
        preview: ScrollMetrics,
        top_line: Option<u32>,
        now: Instant,
    ) -> Option<PreviewTarget> {
        if !self.guard.try_begin(SyncSource::Editor) {
            log::trace!("Editor scroll ignored, {:?} in flight", self.guard.state());
            return None;
        }
        let fraction = self.editor.sample(editor, self.config.growth_threshold_px);
        let at_bottom = editor.is_at_bottom(self.config.bottom_tolerance_px);
        self.editor_pinned = at_bottom;

        if self.lock.is_locked(now) || at_bottom {
            return Some(Self::bottom(preview));
        }
        if let Some(target) = top_line.and_then(|line| self.anchored(line, preview)) {
            return Some(target);
        }
        Some(PreviewTarget {
            scroll_top: preview.offset_for_fraction(fraction),
            fraction,
            anchor_line: None,
        })
    }

    /// The preview scrolled. Only user-driven scrolls are mirrored; the
    /// echo of a programmatic scroll returns `None`.
    pub fn on_preview_scroll(
        &mut self,
        preview: ScrollMetrics,
        editor: ScrollMetrics,
        now: Instant,
    ) -> Option<EditorTarget> {
        let fraction = self.preview.sample(preview, self.config.growth_threshold_px);
        if !self.guard.is_idle() {
            log::trace!("Preview scroll ignored, {:?} in flight", self.guard.state());
            return None;
        }
        if !self.user_driven(now) || self.lock.is_locked(now) {
            return None;
        }
        self.guard.take_over(SyncSource::Preview);

        // The editor's own scroll event for this move is swallowed by the
        // guard, so its pin follows the target here.
        if preview.is_at_bottom(self.config.bottom_tolerance_px) {
            self.editor_pinned = true;
            return Some(EditorTarget::Offset(editor.max_scroll()));
        }
        self.editor_pinned = false;
        if let Some(line) = self
            .anchors
            .line_at_offset(preview.scroll_top + self.config.anchor_margin_px)
        {
            return Some(EditorTarget::Line(line));
        }
        Some(EditorTarget::Offset(editor.offset_for_fraction(fraction)))
    }

    /// Editor content changed. Engages the lock when the editor was pinned
    /// to its bottom, and returns the preview target while locked.
    pub fn on_content_changed(
        &mut self,
        editor: ScrollMetrics,
        preview: ScrollMetrics,
        now: Instant,
    ) -> Option<PreviewTarget> {
        if self.editor_pinned {
            log::debug!("Content changed at the bottom ({}px tall), locking preview", editor.scroll_height);
            self.lock.engage(now);
        }
        self.locked_target(preview, now)
    }

    /// A newline was typed with the caret at the very end of the document.
    ///
    /// Typing takes over the guard: a preview-driven sync in flight is
    /// superseded by the pin.
    pub fn on_caret_at_end_newline(&mut self, preview: ScrollMetrics, now: Instant) -> PreviewTarget {
        log::debug!("Newline at end of document, locking preview");
        self.editor_pinned = true;
        self.lock.engage(now);
        self.take_over_for_lock();
        Self::bottom(preview)
    }

    /// The preview re-rendered. Replaces the anchors; while locked, returns
    /// the new bottom so the pin survives the layout change.
    pub fn on_preview_layout(
        &mut self,
        anchors: AnchorMap,
        preview: ScrollMetrics,
        now: Instant,
    ) -> Option<PreviewTarget> {
        self.anchors = anchors;
        self.preview.reset();
        self.locked_target(preview, now)
    }

    fn locked_target(&mut self, preview: ScrollMetrics, now: Instant) -> Option<PreviewTarget> {
        if !self.lock.is_locked(now) {
            return None;
        }
        self.take_over_for_lock();
        Some(Self::bottom(preview))
    }

    fn take_over_for_lock(&mut self) {
        let previous = self.guard.take_over(SyncSource::Editor);
        if previous == GuardState::FromPreview {
            log::trace!("Bottom lock superseded a preview-driven sync");
        }
    }

    fn anchored(&self, line: u32, preview: ScrollMetrics) -> Option<PreviewTarget> {
        let anchor = self.anchors.anchor_for_line(line)?;
        let max = preview.max_scroll();
        let scroll_top = (anchor.offset - self.config.anchor_margin_px).clamp(0.0, max);
        Some(PreviewTarget {
            scroll_top,
            fraction: ScrollMetrics::new(scroll_top, preview.scroll_height, preview.viewport_height).fraction(),
            anchor_line: Some(anchor.line),
        })
    }

    fn bottom(preview: ScrollMetrics) -> PreviewTarget {
        PreviewTarget {
            scroll_top: preview.max_scroll(),
            fraction: 1.0,
            anchor_line: None,
        }
    }

    fn user_driven(&self, now: Instant) -> bool {
        self.last_interaction
            .is_some_and(|at| now.saturating_duration_since(at) <= self.config.interaction_window)
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}
