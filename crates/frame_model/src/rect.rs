use serde::{Deserialize, Serialize};

/// Edge value used by upstream nodes to report an unbounded region.
pub const INFINITE_COORD: i32 = i32::MAX / 2;

/// Half-open integer rectangle `[x1, x2) x [y1, y2)` in image space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl PixelRect {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub const fn infinite() -> Self {
        Self {
            x1: -INFINITE_COORD,
            y1: -INFINITE_COORD,
            x2: INFINITE_COORD,
            y2: INFINITE_COORD,
        }
    }

    pub fn width(&self) -> u32 {
        if self.x2 <= self.x1 {
            return 0;
        }
        (self.x2 as i64 - self.x1 as i64) as u32
    }

    pub fn height(&self) -> u32 {
        if self.y2 <= self.y1 {
            return 0;
        }
        (self.y2 as i64 - self.y1 as i64) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    /// True when any edge sits at or beyond the infinite sentinel.
    pub fn is_unbounded(&self) -> bool {
        self.x1 <= -INFINITE_COORD
            || self.y1 <= -INFINITE_COORD
            || self.x2 >= INFINITE_COORD
            || self.y2 >= INFINITE_COORD
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }

    /// Overlap of both rectangles, `None` when they do not overlap.
    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let clipped = PixelRect {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        if clipped.is_empty() {
            None
        } else {
            Some(clipped)
        }
    }

    /// Replaces every unbounded edge by the matching edge of `window`.
    pub fn clip_unbounded_to(&self, window: &PixelRect) -> PixelRect {
        PixelRect {
            x1: if self.x1 <= -INFINITE_COORD {
                window.x1
            } else {
                self.x1
            },
            y1: if self.y1 <= -INFINITE_COORD {
                window.y1
            } else {
                self.y1
            },
            x2: if self.x2 >= INFINITE_COORD {
                window.x2
            } else {
                self.x2
            },
            y2: if self.y2 >= INFINITE_COORD {
                window.y2
            } else {
                self.y2
            },
        }
    }
}
