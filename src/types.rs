// src/types.rs

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in screen coordinates.
///
/// `right`/`bottom` are exclusive edges; a region is only usable when
/// `right > left` and `bottom > top`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Region {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    /// Shrink by per-side insets (positive insets move every edge inward).
    pub fn inset(&self, left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left: self.left + left,
            top: self.top + top,
            right: self.right - right,
            bottom: self.bottom - bottom,
        }
    }

    /// Scale all four coordinates by two. Used to map a rectangle found in
    /// a half-resolution frame back to full resolution.
    pub fn doubled(&self) -> Self {
        Self {
            left: self.left * 2,
            top: self.top * 2,
            right: self.right * 2,
            bottom: self.bottom * 2,
        }
    }
}

/// One of the four directional lanes, ordered left-to-right as they appear
/// in the capture: left, down, up, right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Down,
    Up,
    Right,
}

impl Direction {
    pub const LANE_ORDER: [Direction; 4] = [
        Direction::Left,
        Direction::Down,
        Direction::Up,
        Direction::Right,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Down => "down",
            Self::Up => "up",
            Self::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub template: TemplateConfig,
    pub control: ControlConfig,
    pub debug: DebugConfig,
    pub logging: LoggingConfig,
}

/// Which screen-capture backend the loop instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMethod {
    /// Full-monitor grab, then crop to the requested rectangle.
    Blit,
    /// Direct region grab; cheaper when the backend supports it.
    Region,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub method: CaptureMethod,
    /// Insets applied to the primary monitor rectangle to form the initial
    /// capture region, before border calibration refines it.
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Path to the upward marker image; the other three lane templates are
    /// rotations of this one.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub combo_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    pub save_frames: bool,
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_dimensions() {
        let r = Region::new(10, 20, 110, 220);
        assert_eq!(r.width(), 100);
        assert_eq!(r.height(), 200);
        assert!(r.is_valid());
    }

    #[test]
    fn test_region_inset() {
        let r = Region::new(0, 0, 1920, 1080).inset(5, 10, 15, 20);
        assert_eq!(r, Region::new(5, 10, 1905, 1060));
    }

    #[test]
    fn test_degenerate_region_rejected() {
        assert!(!Region::new(50, 0, 50, 100).is_valid());
        assert!(!Region::new(0, 80, 100, 20).is_valid());
    }

    #[test]
    fn test_doubled_maps_half_res_back() {
        let r = Region::new(3, 4, 50, 60).doubled();
        assert_eq!(r, Region::new(6, 8, 100, 120));
    }
}
