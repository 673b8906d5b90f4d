//! Binds an editor surface and a preview surface to a [`Reconciler`].
//!
//! The link holds weak references: once a surface is dropped, events are
//! ignored and nothing is applied.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::anchors::AnchorMap;
use crate::metrics::ScrollMetrics;
use crate::reconciler::{EditorTarget, PreviewTarget, Reconciler, ReconcilerConfig};

/// The source editor viewport.
pub trait EditorSurface {
    fn metrics(&self) -> ScrollMetrics;
    /// Source line at the top of the viewport, if the editor knows it.
    fn top_line(&self) -> Option<u32>;
    fn scroll_to_line(&mut self, line: u32);
    fn scroll_to(&mut self, offset: f32);
}

/// The rendered preview viewport.
pub trait PreviewSurface {
    fn metrics(&self) -> ScrollMetrics;
    /// `(source-line attribute, offset from content top)` per rendered
    /// block, in document order.
    fn source_blocks(&self) -> Vec<(String, f32)>;
    fn scroll_to(&mut self, offset: f32);
}

pub struct ScrollLink<E: EditorSurface, P: PreviewSurface> {
    editor: Weak<RefCell<E>>,
    preview: Weak<RefCell<P>>,
    reconciler: Reconciler,
}

impl<E: EditorSurface, P: PreviewSurface> ScrollLink<E, P> {
    pub fn new(editor: &Rc<RefCell<E>>, preview: &Rc<RefCell<P>>, config: ReconcilerConfig) -> Self {
        Self {
            editor: Rc::downgrade(editor),
            preview: Rc::downgrade(preview),
            reconciler: Reconciler::new(config),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut Reconciler {
        &mut self.reconciler
    }

    /// Both surfaces are still alive.
    pub fn is_attached(&self) -> bool {
        self.editor.strong_count() > 0 && self.preview.strong_count() > 0
    }

    fn surfaces(&self) -> Option<(Rc<RefCell<E>>, Rc<RefCell<P>>)> {
        Some((self.editor.upgrade()?, self.preview.upgrade()?))
    }

    /// Editor scroll event. Returns whether the preview was moved.
    pub fn editor_scrolled(&mut self, now: Instant) -> bool {
        let Some((editor, preview)) = self.surfaces() else {
            return false;
        };
        let (metrics, top_line) = {
            let editor = editor.borrow();
            (editor.metrics(), editor.top_line())
        };
        let preview_metrics = preview.borrow().metrics();
        match self.reconciler.on_editor_scroll(metrics, preview_metrics, top_line, now) {
            Some(target) => {
                preview.borrow_mut().scroll_to(target.scroll_top);
                true
            }
            None => false,
        }
    }

    /// Preview scroll event. Returns whether the editor was moved.
    pub fn preview_scrolled(&mut self, now: Instant) -> bool {
        let Some((editor, preview)) = self.surfaces() else {
            return false;
        };
        let preview_metrics = preview.borrow().metrics();
        let editor_metrics = editor.borrow().metrics();
        match self.reconciler.on_preview_scroll(preview_metrics, editor_metrics, now) {
            Some(EditorTarget::Line(line)) => {
                editor.borrow_mut().scroll_to_line(line);
                true
            }
            Some(EditorTarget::Offset(offset)) => {
                editor.borrow_mut().scroll_to(offset);
                true
            }
            None => false,
        }
    }

    /// Pointer or wheel input landed on the preview.
    pub fn preview_interacted(&mut self, now: Instant) {
        self.reconciler.note_preview_interaction(now);
    }

    /// The editor's text changed.
    pub fn content_changed(&mut self, now: Instant) -> bool {
        let Some((editor, preview)) = self.surfaces() else {
            return false;
        };
        let editor_metrics = editor.borrow().metrics();
        let preview_metrics = preview.borrow().metrics();
        let target = self.reconciler.on_content_changed(editor_metrics, preview_metrics, now);
        Self::apply_preview(&preview, target)
    }

    /// A newline was typed with the caret at the end of the document.
    pub fn caret_newline_at_end(&mut self, now: Instant) -> bool {
        let Some((_, preview)) = self.surfaces() else {
            return false;
        };
        let preview_metrics = preview.borrow().metrics();
        let target = self.reconciler.on_caret_at_end_newline(preview_metrics, now);
        Self::apply_preview(&preview, Some(target))
    }

    /// The preview re-rendered: rebuild anchors from its blocks.
    pub fn preview_rendered(&mut self, now: Instant) -> bool {
        let Some((_, preview)) = self.surfaces() else {
            return false;
        };
        let (blocks, metrics) = {
            let preview = preview.borrow();
            (preview.source_blocks(), preview.metrics())
        };
        let anchors = AnchorMap::from_blocks(blocks.iter().map(|(attr, offset)| (attr.as_str(), *offset)));
        log::trace!("Preview rendered with {} anchors", anchors.len());
        let target = self.reconciler.on_preview_layout(anchors, metrics, now);
        Self::apply_preview(&preview, target)
    }

    /// Call once the tick that applied a scroll has passed.
    pub fn settle(&mut self) {
        self.reconciler.settle();
    }

    fn apply_preview(preview: &Rc<RefCell<P>>, target: Option<PreviewTarget>) -> bool {
        match target {
            Some(target) => {
                preview.borrow_mut().scroll_to(target.scroll_top);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeEditor {
        metrics: ScrollMetrics,
        scrolls: Vec<f32>,
    }

    impl EditorSurface for FakeEditor {
        fn metrics(&self) -> ScrollMetrics {
            self.metrics
        }
        fn top_line(&self) -> Option<u32> {
            None
        }
        fn scroll_to_line(&mut self, _line: u32) {}
        fn scroll_to(&mut self, offset: f32) {
            self.scrolls.push(offset);
        }
    }

    #[derive(Default)]
    struct FakePreview {
        metrics: ScrollMetrics,
    }

    impl PreviewSurface for FakePreview {
        fn metrics(&self) -> ScrollMetrics {
            self.metrics
        }
        fn source_blocks(&self) -> Vec<(String, f32)> {
            Vec::new()
        }
        fn scroll_to(&mut self, offset: f32) {
            self.metrics.scroll_top = offset;
        }
    }

    #[test]
    fn test_detached_surface_is_ignored() {
        let editor = Rc::new(RefCell::new(FakeEditor::default()));
        let preview = Rc::new(RefCell::new(FakePreview::default()));
        let mut link = ScrollLink::new(&editor, &preview, ReconcilerConfig::default());
        assert!(link.is_attached());

        drop(preview);
        assert!(!link.is_attached());
        assert!(!link.editor_scrolled(Instant::now()));
        assert!(!link.preview_scrolled(Instant::now()));
        assert!(!link.content_changed(Instant::now()));
        assert!(!link.caret_newline_at_end(Instant::now()));
        assert!(!link.preview_rendered(Instant::now()));
    }

    #[test]
    fn test_editor_scroll_moves_preview() {
        let editor = Rc::new(RefCell::new(FakeEditor {
            metrics: ScrollMetrics::new(250.0, 1000.0, 500.0),
            ..FakeEditor::default()
        }));
        let preview = Rc::new(RefCell::new(FakePreview {
            metrics: ScrollMetrics::new(0.0, 2500.0, 500.0),
        }));
        let mut link = ScrollLink::new(&editor, &preview, ReconcilerConfig::default());

        assert!(link.editor_scrolled(Instant::now()));
        assert_eq!(preview.borrow().metrics.scroll_top, 1000.0);
        assert!(editor.borrow().scrolls.is_empty());
    }
}
