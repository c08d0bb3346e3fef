// src/capture.rs
//
// Screen-capture backends. Both produce an RGBA buffer for a rectangular
// screen region or a discriminated failure; every recoverable condition is
// an error value, never a panic, so the detect loop can skip the frame.

use crate::types::{CaptureMethod, Region};
use image::RgbaImage;
use thiserror::Error;
use xcap::Monitor;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no monitor available")]
    NoMonitor,
    #[error("invalid capture region {0:?}")]
    InvalidRegion(Region),
    #[error("capture region {0:?} lies outside the monitor")]
    OutOfBounds(Region),
    #[error("screen grab failed: {0}")]
    Backend(#[from] xcap::XCapError),
}

pub trait CaptureBackend: Send {
    fn grab(&mut self, region: Region) -> Result<RgbaImage, CaptureError>;
}

fn primary_monitor() -> Result<Monitor, CaptureError> {
    let monitors = Monitor::all()?;
    monitors
        .into_iter()
        .find(|m| m.is_primary().unwrap_or(false))
        .map(Ok)
        .unwrap_or_else(|| {
            Monitor::all()?
                .into_iter()
                .next()
                .ok_or(CaptureError::NoMonitor)
        })
}

/// The primary monitor's rectangle in screen coordinates; the base the
/// configured insets are applied to.
pub fn primary_screen_region() -> Result<Region, CaptureError> {
    let monitor = primary_monitor()?;
    let x = monitor.x()?;
    let y = monitor.y()?;
    let w = monitor.width()? as i32;
    let h = monitor.height()? as i32;
    Ok(Region::new(x, y, x + w, y + h))
}

/// Screen region -> monitor-relative pixel rectangle, bounds-checked.
fn monitor_relative(
    monitor: &Monitor,
    region: Region,
) -> Result<(u32, u32, u32, u32), CaptureError> {
    if !region.is_valid() {
        return Err(CaptureError::InvalidRegion(region));
    }
    let mx = monitor.x()?;
    let my = monitor.y()?;
    let mw = monitor.width()? as i32;
    let mh = monitor.height()? as i32;
    let rel_x = region.left - mx;
    let rel_y = region.top - my;
    if rel_x < 0 || rel_y < 0 || rel_x + region.width() > mw || rel_y + region.height() > mh {
        return Err(CaptureError::OutOfBounds(region));
    }
    Ok((
        rel_x as u32,
        rel_y as u32,
        region.width() as u32,
        region.height() as u32,
    ))
}

/// Grabs the whole monitor and crops. Slower, but works everywhere the
/// compositor allows full-screen blits.
pub struct BlitCapture {
    monitor: Monitor,
}

impl BlitCapture {
    pub fn new() -> Result<Self, CaptureError> {
        Ok(Self {
            monitor: primary_monitor()?,
        })
    }
}

impl CaptureBackend for BlitCapture {
    fn grab(&mut self, region: Region) -> Result<RgbaImage, CaptureError> {
        let (x, y, w, h) = monitor_relative(&self.monitor, region)?;
        let full = self.monitor.capture_image()?;
        Ok(image::imageops::crop_imm(&full, x, y, w, h).to_image())
    }
}

/// Asks the backend for just the requested rectangle; the higher
/// performance path when available.
pub struct RegionCapture {
    monitor: Monitor,
}

impl RegionCapture {
    pub fn new() -> Result<Self, CaptureError> {
        Ok(Self {
            monitor: primary_monitor()?,
        })
    }
}

impl CaptureBackend for RegionCapture {
    fn grab(&mut self, region: Region) -> Result<RgbaImage, CaptureError> {
        let (x, y, w, h) = monitor_relative(&self.monitor, region)?;
        Ok(self.monitor.capture_region(x, y, w, h)?)
    }
}

pub fn create_backend(method: CaptureMethod) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    Ok(match method {
        CaptureMethod::Blit => Box::new(BlitCapture::new()?),
        CaptureMethod::Region => Box::new(RegionCapture::new()?),
    })
}
