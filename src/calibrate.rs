// src/calibrate.rs
//
// Auto-calibration of the capture rectangle against the game's on-screen
// frame border. Border candidates vote across consecutive frames; once
// enough agree within a pixel tolerance the capture region is adjusted
// once and calibration is done for the session.

use crate::types::Region;
use tracing::warn;

/// Consecutive agreeing candidates required before the border is trusted.
pub const BORDER_MATCH_COUNT: u32 = 4;

/// Per-edge pixel tolerance for two candidates to count as the same border.
const EDGE_TOLERANCE: i32 = 20;

fn within_limit(a: Region, b: Region) -> bool {
    (a.left - b.left).abs() < EDGE_TOLERANCE
        && (a.top - b.top).abs() < EDGE_TOLERANCE
        && (a.right - b.right).abs() < EDGE_TOLERANCE
        && (a.bottom - b.bottom).abs() < EDGE_TOLERANCE
}

pub struct Calibrator {
    threshold: u32,
    accepted: Option<Region>,
    votes: u32,
    locked: bool,
}

impl Calibrator {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            accepted: None,
            votes: 0,
            locked: false,
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Submit one border candidate (full-resolution coordinates, relative
    /// to the capture region). Returns the winning border on the call that
    /// locks calibration; all earlier and later calls return `None`.
    pub fn offer(&mut self, candidate: Region) -> Option<Region> {
        if self.locked {
            return None;
        }
        match self.accepted {
            Some(accepted) if within_limit(accepted, candidate) => {
                self.votes += 1;
            }
            _ => {
                self.accepted = Some(candidate);
                self.votes = 1;
            }
        }
        if self.votes > self.threshold {
            self.locked = true;
            self.accepted
        } else {
            None
        }
    }
}

/// Shift and shrink the capture region onto the detected border, clamped so
/// the adjusted region never exceeds the original. A degenerate result
/// discards the adjustment and keeps the previous region.
pub fn apply_border(region: Region, border: Region) -> Region {
    let left = region.left + border.left;
    let top = region.top + border.top;
    let adjusted = Region {
        left,
        top,
        right: (left + border.width()).min(region.right),
        bottom: (top + border.height()).min(region.bottom),
    };
    if adjusted.is_valid() {
        adjusted
    } else {
        warn!(
            ?adjusted,
            "border adjustment would be degenerate; keeping previous region"
        );
        region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_candidates_lock_exactly_once() {
        let mut c = Calibrator::new(BORDER_MATCH_COUNT);
        let border = Region::new(12, 8, 700, 520);
        let mut locks = 0;
        for _ in 0..=BORDER_MATCH_COUNT + 3 {
            if c.offer(border).is_some() {
                locks += 1;
            }
        }
        assert_eq!(locks, 1);
        assert!(c.locked());
    }

    #[test]
    fn test_divergent_candidate_resets_count() {
        let mut c = Calibrator::new(2);
        let a = Region::new(0, 0, 400, 300);
        let b = Region::new(90, 90, 500, 400); // far outside tolerance
        assert!(c.offer(a).is_none());
        assert!(c.offer(a).is_none());
        assert!(c.offer(b).is_none()); // replaces, votes back to 1
        assert!(c.offer(b).is_none());
        assert!(c.offer(b).is_some()); // votes 3 > 2
    }

    #[test]
    fn test_jitter_within_tolerance_still_votes() {
        let mut c = Calibrator::new(2);
        assert!(c.offer(Region::new(10, 10, 400, 300)).is_none());
        assert!(c.offer(Region::new(14, 6, 405, 296)).is_none());
        assert!(c.offer(Region::new(8, 12, 398, 303)).is_some());
    }

    #[test]
    fn test_region_adjusted_exactly_once_after_lock() {
        // Capture {0,0,100,100}, border {5,5,95,90} repeated with
        // threshold 7: lock on the 8th vote, region becomes {5,5,95,90}.
        let mut c = Calibrator::new(7);
        let border = Region::new(5, 5, 95, 90);
        let mut region = Region::new(0, 0, 100, 100);
        let mut applications = 0;
        for _ in 0..8 {
            if let Some(winner) = c.offer(border) {
                region = apply_border(region, winner);
                applications += 1;
            }
        }
        assert_eq!(applications, 1);
        assert_eq!(region, Region::new(5, 5, 95, 90));
    }

    #[test]
    fn test_adjustment_clamped_to_original_bounds() {
        let region = Region::new(100, 100, 300, 300);
        let border = Region::new(50, 50, 350, 320); // wider than the region
        let adjusted = apply_border(region, border);
        assert_eq!(adjusted, Region::new(150, 150, 300, 300));
    }

    #[test]
    fn test_degenerate_adjustment_discarded() {
        let region = Region::new(0, 0, 100, 100);
        // Offset pushes the whole border outside the region.
        let border = Region::new(120, 120, 180, 180);
        assert_eq!(apply_border(region, border), region);
    }
}
