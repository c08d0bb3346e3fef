// src/vision.rs
//
// Thin interpretation layer over the OpenCV primitives: grayscale
// conversion of captured buffers, frame-border detection for calibration,
// banded template correlation, and reduction of a correlation surface to a
// sparse sorted list of marker bottom edges.

use crate::tracker::MATCH_GAP;
use crate::types::Region;
use anyhow::{ensure, Result};
use image::RgbaImage;
use opencv::{
    core::{self, Mat, Point, Rect, Size, Vector},
    imgproc,
    prelude::*,
};

/// Correlation score below which a location is not a marker candidate.
/// Low on purpose: markers are frequently half-occluded by effects and the
/// tracker copes with spurious extras better than with misses.
pub const MATCH_THRESHOLD: f32 = 0.55;

/// Convert a captured RGBA buffer into a single-channel OpenCV matrix.
pub fn gray_mat(image: &RgbaImage) -> Result<Mat> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    ensure!(w > 0 && h > 0, "empty capture buffer");
    let raw = image.as_raw();
    let mut gray = vec![0u8; w * h];
    for (dst, px) in gray.iter_mut().zip(raw.chunks_exact(4)) {
        // integer BT.601 luma
        let luma = 77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32;
        *dst = (luma >> 8) as u8;
    }
    let mat = Mat::from_slice_rows_cols(&gray, h, w)?;
    Ok(mat)
}

/// Convert a captured RGBA buffer into a BGR matrix for color annotation.
pub fn bgr_mat(image: &RgbaImage) -> Result<Mat> {
    let (w, h) = (image.width() as i32, image.height() as i32);
    ensure!(w > 0 && h > 0, "empty capture buffer");
    let mut mat =
        Mat::new_rows_cols_with_default(h, w, core::CV_8UC3, core::Scalar::all(0.0))?;
    for y in 0..h {
        let row = mat.at_row_mut::<core::Vec3b>(y)?;
        for x in 0..w {
            let px = image.get_pixel(x as u32, y as u32);
            row[x as usize] = core::Vec3b::from([px[2], px[1], px[0]]);
        }
    }
    Ok(mat)
}

/// Downsample to half resolution for the calibration pass.
pub fn halved(gray: &Mat) -> Result<Mat> {
    let mut half = Mat::default();
    imgproc::resize(
        gray,
        &mut half,
        Size::new(0, 0),
        0.5,
        0.5,
        imgproc::INTER_AREA,
    )?;
    Ok(half)
}

/// Resize by an arbitrary scale with nearest-neighbor interpolation; used
/// to normalize the tracking frame to the template working width.
pub fn scaled_nearest(gray: &Mat, scale: f64) -> Result<Mat> {
    let mut out = Mat::default();
    imgproc::resize(gray, &mut out, Size::new(0, 0), scale, scale, imgproc::INTER_NEAREST)?;
    Ok(out)
}

fn edges_of(gray: &Mat) -> Result<Mat> {
    let mut blurred = Mat::default();
    imgproc::gaussian_blur(
        gray,
        &mut blurred,
        Size::new(5, 5),
        0.0,
        0.0,
        core::BORDER_DEFAULT,
    )?;
    let mut edges = Mat::default();
    imgproc::canny(&blurred, &mut edges, 50.0, 200.0, 3, false)?;
    Ok(edges)
}

fn side_length(a: Point, b: Point) -> f64 {
    let dx = (a.x - b.x) as f64;
    let dy = (a.y - b.y) as f64;
    (dx * dx + dy * dy).sqrt()
}

/// Detect the game's rectangular frame border.
///
/// Contours are approximated to polygons; convex quadrilaterals whose four
/// sides all exceed `minimum_size` vote, and the axis-aligned union of the
/// voters is the border. `None` is not an error, just no vote this frame.
pub fn detect_border(gray: &Mat, minimum_size: i32) -> Result<Option<Region>> {
    if gray.empty() {
        return Ok(None);
    }
    let edges = edges_of(gray)?;

    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours(
        &edges,
        &mut contours,
        imgproc::RETR_TREE,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;

    let min = minimum_size as f64;
    let mut border: Option<Region> = None;
    for contour in contours.iter() {
        let mut approx = Vector::<Point>::new();
        let eps = 0.02 * imgproc::arc_length(&contour, true)?;
        imgproc::approx_poly_dp(&contour, &mut approx, eps, true)?;

        if approx.len() != 4 || !imgproc::is_contour_convex(&approx)? {
            continue;
        }
        let p = approx.to_vec();
        let sides = [
            side_length(p[0], p[1]),
            side_length(p[2], p[3]),
            side_length(p[0], p[2]),
            side_length(p[1], p[3]),
        ];
        if sides.iter().any(|&s| s < min) {
            continue;
        }

        let rect = imgproc::bounding_rect(&approx)?;
        let quad = Region::new(rect.x, rect.y, rect.x + rect.width, rect.y + rect.height);
        border = Some(match border {
            None => quad,
            Some(b) => Region::new(
                b.left.min(quad.left),
                b.top.min(quad.top),
                b.right.max(quad.right),
                b.bottom.max(quad.bottom),
            ),
        });
    }

    Ok(border.filter(|b| b.width() >= minimum_size && b.height() >= minimum_size))
}

/// Run normalized template correlation inside one lane band and return the
/// raw correlation surface. The band is clamped to the image first.
pub fn match_in_band(gray: &Mat, template: &Mat, mut band: Rect) -> Result<Mat> {
    band.x = band.x.max(0);
    band.y = band.y.max(0);
    band.width = band.width.min(gray.cols() - band.x);
    band.height = band.height.min(gray.rows() - band.y);

    let roi = Mat::roi(gray, band)?;
    let mut result = Mat::default();
    imgproc::match_template(
        &roi,
        template,
        &mut result,
        imgproc::TM_CCOEFF_NORMED,
        &core::no_array(),
    )?;
    Ok(result)
}

/// Collapses a stream of thresholded correlation peaks, visited in
/// row-major order, into sorted candidate Y positions. Peaks closer than
/// MATCH_GAP to the last accepted one compete on score instead of
/// appending.
pub struct PeakReducer {
    threshold: f32,
    bottom_offset: i32,
    last_y: i32,
    last_score: f32,
    out: Vec<i32>,
}

impl PeakReducer {
    pub fn new(threshold: f32, bottom_offset: i32) -> Self {
        Self {
            threshold,
            bottom_offset,
            last_y: 0,
            last_score: 0.0,
            out: Vec::with_capacity(50),
        }
    }

    pub fn offer(&mut self, y: i32, score: f32) {
        if score < self.threshold {
            return;
        }
        if (y - self.last_y).abs() > MATCH_GAP {
            self.out.push(y + self.bottom_offset);
            self.last_y = y;
            self.last_score = score;
        } else if score > self.last_score {
            match self.out.last_mut() {
                Some(last) => *last = y + self.bottom_offset,
                None => self.out.push(y + self.bottom_offset),
            }
            self.last_y = y;
            self.last_score = score;
        }
    }

    pub fn finish(self) -> Vec<i32> {
        self.out
    }
}

/// Reduce a correlation surface to sorted candidate bottom-edge Ys. The
/// template height is added so positions refer to a marker's bottom edge
/// rather than its top-left match origin.
pub fn bottom_ys(result: &Mat, template_rows: i32) -> Result<Vec<i32>> {
    let mut reducer = PeakReducer::new(MATCH_THRESHOLD, template_rows);
    for y in 0..result.rows() {
        for x in 0..result.cols() {
            reducer.offer(y, *result.at_2d::<f32>(y, x)?);
        }
    }
    Ok(reducer.finish())
}

/// The four lane templates, all rotations of one base marker.
pub struct LaneTemplates {
    pub left: Mat,
    pub down: Mat,
    pub up: Mat,
    pub right: Mat,
}

impl LaneTemplates {
    /// `base` is the upward marker in grayscale.
    pub fn build(base: &Mat) -> Result<Self> {
        ensure!(!base.empty(), "marker template is empty");
        let up = base.clone();
        let mut left = Mat::default();
        core::rotate(&up, &mut left, core::ROTATE_90_COUNTERCLOCKWISE)?;
        let mut right = Mat::default();
        core::rotate(&up, &mut right, core::ROTATE_90_CLOCKWISE)?;
        let mut down = Mat::default();
        core::rotate(&left, &mut down, core::ROTATE_90_COUNTERCLOCKWISE)?;
        Ok(Self {
            left,
            down,
            up,
            right,
        })
    }

    /// Templates in lane band order: left, down, up, right.
    pub fn in_lane_order(&self) -> [&Mat; 4] {
        [&self.left, &self.down, &self.up, &self.right]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reduce(points: &[(i32, f32)]) -> Vec<i32> {
        let mut r = PeakReducer::new(MATCH_THRESHOLD, 10);
        for &(y, score) in points {
            r.offer(y, score);
        }
        r.finish()
    }

    #[test]
    fn test_peaks_below_threshold_ignored() {
        assert!(reduce(&[(5, 0.3), (40, 0.54)]).is_empty());
    }

    #[test]
    fn test_distinct_peaks_kept_with_offset() {
        assert_eq!(reduce(&[(30, 0.7), (60, 0.8)]), vec![40, 70]);
    }

    #[test]
    fn test_nearby_peak_replaces_on_better_score() {
        // 62 is within MATCH_GAP of 60 and scores higher, so it replaces
        // the previous candidate instead of appending.
        assert_eq!(reduce(&[(30, 0.7), (60, 0.8), (62, 0.9)]), vec![40, 72]);
    }

    #[test]
    fn test_nearby_weaker_peak_dropped() {
        assert_eq!(reduce(&[(30, 0.7), (60, 0.8), (62, 0.6)]), vec![40, 70]);
    }

    #[test]
    fn test_first_peak_near_origin_competes_with_nothing() {
        // y=3 is within MATCH_GAP of the initial last_y=0; the reducer must
        // still emit it rather than index past an empty list.
        assert_eq!(reduce(&[(3, 0.9)]), vec![13]);
    }

    #[test]
    fn test_output_sorted_ascending() {
        let out = reduce(&[(10, 0.6), (50, 0.9), (100, 0.7), (140, 0.56)]);
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_eq!(out, sorted);
        assert_eq!(out.len(), 4);
    }
}
