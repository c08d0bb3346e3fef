// src/debug.rs
//
// Debug artifacts: annotated frames dumped to a scratch directory when the
// debug flag is on. Observability only, never part of the control flow.

use crate::types::Region;
use anyhow::Result;
use opencv::{
    core::{Mat, Point, Rect, Scalar, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use std::path::PathBuf;
use tracing::info;

/// Frame files cycle through this many names before overwriting.
const MAX_CYCLE_FILES: u32 = 100;

pub struct DebugSink {
    dir: PathBuf,
    seq: u32,
}

impl DebugSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, seq: 0 })
    }

    /// Draw one horizontal line per candidate in each lane band, then save
    /// the frame under a cycling numeric name.
    pub fn save_annotated(&mut self, frame: &mut Mat, lanes: &[Vec<i32>; 4], band_w: i32) -> Result<()> {
        for (i, matches) in lanes.iter().enumerate() {
            let x0 = band_w * i as i32;
            for &y in matches {
                imgproc::line(
                    frame,
                    Point::new(x0, y),
                    Point::new(x0 + band_w, y),
                    Scalar::new(255.0, 255.0, 255.0, 0.0),
                    2,
                    imgproc::LINE_8,
                    0,
                )?;
            }
        }
        self.seq %= MAX_CYCLE_FILES;
        let path = self.dir.join(format!("{}.jpg", self.seq));
        self.seq += 1;
        imgcodecs::imwrite(
            path.to_str().unwrap_or_default(),
            frame,
            &Vector::<i32>::new(),
        )?;
        Ok(())
    }

    /// Save the frame that achieved border lock, with the border drawn in.
    pub fn save_border_frame(&self, frame: &mut Mat, border: Region) -> Result<()> {
        imgproc::rectangle(
            frame,
            Rect::new(border.left, border.top, border.width(), border.height()),
            Scalar::new(0.0, 0.0, 255.0, 0.0),
            2,
            imgproc::LINE_8,
            0,
        )?;
        let path = self.dir.join("screen.jpg");
        imgcodecs::imwrite(
            path.to_str().unwrap_or_default(),
            frame,
            &Vector::<i32>::new(),
        )?;
        info!(path = %path.display(), "saved border lock frame");
        Ok(())
    }
}

pub fn log_detections(lane: &str, detections: &[i32]) {
    let mut joined = String::new();
    for d in detections {
        joined.push_str(&format!("{},", d));
    }
    info!(lane, detections = %joined, "lane candidates");
}
