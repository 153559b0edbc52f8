// Viewport intersection math. Mirrors what a browser IntersectionObserver reports
// for a target against the root viewport.

use crate::types::Rect;

impl Rect {
    /// Overlap of two rects. `Some` with zero width/height when they only share an edge.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let left = self.left().max(other.left());
        let top = self.top().max(other.top());
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right < left || bottom < top {
            return None;
        }
        Some(Rect::new(left, top, right - left, bottom - top))
    }

    /// Fraction of this rect's area visible inside `viewport`, in `[0, 1]`.
    /// A zero-area target touching the viewport counts as fully visible.
    pub fn intersection_ratio(&self, viewport: &Rect) -> f64 {
        match self.intersection(viewport) {
            None => 0.0,
            Some(overlap) => {
                let area = self.area();
                if area <= 0.0 {
                    1.0
                } else {
                    (overlap.area() / area).clamp(0.0, 1.0)
                }
            }
        }
    }
}

/// Whether `target` counts as intersecting `viewport` for a visibility `threshold`.
///
/// A threshold of zero accepts any contact, including edge adjacency. Any other
/// threshold requires that fraction of the target to be on screen.
pub fn is_intersecting(target: &Rect, viewport: &Rect, threshold: f64) -> bool {
    if target.intersection(viewport).is_none() {
        return false;
    }
    if threshold <= 0.0 {
        return true;
    }
    target.intersection_ratio(viewport) >= threshold
}
