//! Scroll geometry and fraction sampling for one scrollable surface.

/// Measured scroll state of a surface, in CSS pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f32,
    pub scroll_height: f32,
    pub viewport_height: f32,
}

impl ScrollMetrics {
    pub fn new(scroll_top: f32, scroll_height: f32, viewport_height: f32) -> Self {
        Self {
            scroll_top,
            scroll_height,
            viewport_height,
        }
    }

    /// Largest valid `scroll_top`. Zero for content that fits the viewport.
    #[inline]
    pub fn max_scroll(&self) -> f32 {
        (self.scroll_height - self.viewport_height).max(0.0)
    }

    /// Whether the viewport touches the bottom edge within `tolerance`.
    /// A surface that cannot scroll is always at its bottom.
    #[inline]
    pub fn is_at_bottom(&self, tolerance: f32) -> bool {
        let max = self.max_scroll();
        max <= 0.0 || max - self.scroll_top <= tolerance
    }

    /// Clamp an offset into `[0, max_scroll]`.
    #[inline]
    pub fn clamp_offset(&self, offset: f32) -> f32 {
        offset.clamp(0.0, self.max_scroll())
    }

    /// `scroll_top / max(1, max_scroll)` clamped to `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        fraction_of(self.scroll_top, self.max_scroll())
    }

    /// Scroll offset that puts the viewport at `fraction`.
    pub fn offset_for_fraction(&self, fraction: f32) -> f32 {
        self.clamp_offset(fraction.clamp(0.0, 1.0) * self.max_scroll())
    }
}

#[inline]
fn fraction_of(scroll_top: f32, denominator: f32) -> f32 {
    if !scroll_top.is_finite() || !denominator.is_finite() {
        return 0.0;
    }
    (scroll_top / denominator.max(1.0)).clamp(0.0, 1.0)
}

/// Samples a surface's scroll fraction across events.
///
/// When the scrollable height grew since the previous sample but
/// `scroll_top` stayed within `growth_threshold` pixels, the growth came
/// from content inserted below the fold. The previous denominator is kept
/// so the fraction does not jump upward.
#[derive(Clone, Debug, Default)]
pub struct FractionTracker {
    last: Option<ScrollMetrics>,
    denominator: f32,
}

impl FractionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, metrics: ScrollMetrics, growth_threshold: f32) -> f32 {
        let current = metrics.max_scroll();
        let denominator = match self.last {
            Some(prev)
                if metrics.scroll_height > prev.scroll_height
                    && (metrics.scroll_top - prev.scroll_top).abs() <= growth_threshold =>
            {
                log::trace!(
                    "Content grew {}px under a still viewport, keeping denominator {}",
                    metrics.scroll_height - prev.scroll_height,
                    self.denominator
                );
                self.denominator
            }
            _ => current,
        };
        self.last = Some(metrics);
        self.denominator = denominator;
        fraction_of(metrics.scroll_top, denominator)
    }

    /// Metrics from the most recent sample.
    pub fn last(&self) -> Option<ScrollMetrics> {
        self.last
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_scroll_and_bottom() {
        let m = ScrollMetrics::new(600.0, 1000.0, 400.0);
        assert_eq!(m.max_scroll(), 600.0);
        assert!(m.is_at_bottom(4.0));
        assert!(ScrollMetrics::new(597.0, 1000.0, 400.0).is_at_bottom(4.0));
        assert!(!ScrollMetrics::new(590.0, 1000.0, 400.0).is_at_bottom(4.0));

        // Content shorter than the viewport cannot scroll.
        let short = ScrollMetrics::new(0.0, 300.0, 400.0);
        assert_eq!(short.max_scroll(), 0.0);
        assert!(short.is_at_bottom(0.0));
    }

    #[test]
    fn test_fraction_clamped() {
        assert_eq!(ScrollMetrics::new(300.0, 1000.0, 400.0).fraction(), 0.5);
        assert_eq!(ScrollMetrics::new(-20.0, 1000.0, 400.0).fraction(), 0.0);
        assert_eq!(ScrollMetrics::new(900.0, 1000.0, 400.0).fraction(), 1.0);
        // Zero-height container divides by one, not zero.
        assert_eq!(ScrollMetrics::new(0.0, 0.0, 0.0).fraction(), 0.0);
        assert_eq!(ScrollMetrics::new(f32::NAN, 1000.0, 400.0).fraction(), 0.0);
    }

    #[test]
    fn test_offset_for_fraction() {
        let m = ScrollMetrics::new(0.0, 1400.0, 400.0);
        assert_eq!(m.offset_for_fraction(0.25), 250.0);
        assert_eq!(m.offset_for_fraction(2.0), 1000.0);
        assert_eq!(m.clamp_offset(-5.0), 0.0);
    }

    #[test]
    fn test_growth_below_fold_keeps_denominator() {
        let mut tracker = FractionTracker::new();
        assert_eq!(tracker.sample(ScrollMetrics::new(300.0, 1000.0, 400.0), 2.0), 0.5);

        // 200px appended below, viewport did not move.
        let f = tracker.sample(ScrollMetrics::new(301.0, 1200.0, 400.0), 2.0);
        assert!((f - 301.0 / 600.0).abs() < 1e-6);

        // A real scroll uses the fresh denominator again.
        let f = tracker.sample(ScrollMetrics::new(400.0, 1200.0, 400.0), 2.0);
        assert_eq!(f, 0.5);
    }

    #[test]
    fn test_growth_with_user_scroll_uses_current() {
        let mut tracker = FractionTracker::new();
        tracker.sample(ScrollMetrics::new(300.0, 1000.0, 400.0), 2.0);
        let f = tracker.sample(ScrollMetrics::new(400.0, 1200.0, 400.0), 2.0);
        assert_eq!(f, 0.5);
        assert_eq!(tracker.last(), Some(ScrollMetrics::new(400.0, 1200.0, 400.0)));

        tracker.reset();
        assert!(tracker.last().is_none());
    }
}
