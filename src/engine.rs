// src/engine.rs
//
// The detection loop: a dedicated background thread that captures the
// screen, calibrates the capture rectangle against the game's frame
// border, then tracks markers per lane and fires key events as they cross
// the exit line. The owning thread drives it through the Control handle;
// cancellation is cooperative and checked at the session and frame
// boundaries only.

use crate::calibrate::{apply_border, Calibrator, BORDER_MATCH_COUNT};
use crate::capture::{self, CaptureBackend};
use crate::debug::{self, DebugSink};
use crate::input::{ComboThrottle, EnigoKeys, KeyTap};
use crate::tracker::LaneTracker;
use crate::types::{CaptureMethod, Config, Direction, Region};
use crate::vision::{self, LaneTemplates};
use anyhow::{ensure, Context, Result};
use image::RgbaImage;
use opencv::core::{Mat, Rect};
use opencv::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Minimum border side length, in half-resolution pixels.
const MINIMUM_LINE_LENGTH: i32 = 170;
/// Exit line sits this many pixels above the bottom of the working frame.
const DETECT_AREA_HEIGHT: i32 = 100;
/// Frames are normalized to this width before correlation so the templates
/// match at the scale they were authored at.
const TEMPLATE_WORKING_WIDTH: f64 = 373.0;
const FRAME_BUDGET_MS: u64 = 45;
const FRAME_FLOOR_MS: u64 = 10;
const FAULT_BACKOFF: Duration = Duration::from_millis(5);
const CONTROL_WAIT: Duration = Duration::from_secs(10);
const SESSION_COOLDOWN: Duration = Duration::from_secs(1);
const FPS_WINDOW_MS: u64 = 10_000;
const VISION_WORKER_THREADS: i32 = 4;

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Parameter snapshot consumed once at the start of each session. Fields
/// are published together so a session never sees a torn mix of old and
/// new values.
#[derive(Debug, Clone)]
pub struct LoopParams {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub method: CaptureMethod,
    pub combo_limit: u32,
    pub save_debug: bool,
    pub debug_dir: String,
}

impl LoopParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            left: config.capture.left,
            top: config.capture.top,
            right: config.capture.right,
            bottom: config.capture.bottom,
            method: config.capture.method,
            combo_limit: config.control.combo_limit,
            save_debug: config.debug.save_frames,
            debug_dir: config.debug.output_dir.clone(),
        }
    }
}

/// Counting wake-up primitive between the control thread and the loop.
struct Gate {
    permits: Mutex<u32>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn release(&self) {
        let mut permits = lock(&self.permits);
        *permits += 1;
        self.cv.notify_one();
    }

    /// Waits for a permit. A timeout is not an error; the caller just
    /// re-checks its stop flag and waits again.
    fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(permits, remaining)
                .unwrap_or_else(|e| e.into_inner());
            permits = guard;
        }
        *permits -= 1;
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Shared {
    running: AtomicBool,
    cancel: AtomicBool,
    gate: Gate,
    params: Mutex<LoopParams>,
    loop_thread: Mutex<Option<ThreadId>>,
}

/// Thread-safe control surface for the detect loop. Clone freely; all
/// clones drive the same loop.
#[derive(Clone)]
pub struct Control {
    shared: Arc<Shared>,
}

impl Control {
    /// Control operations block on loop-side state; calling them from the
    /// loop thread itself would self-deadlock, so such calls are rejected.
    fn from_loop_thread(&self, op: &str) -> bool {
        let loop_id = *lock(&self.shared.loop_thread);
        if loop_id == Some(thread::current().id()) {
            error!(op, "control operation invoked from the detect thread; rejected");
            return true;
        }
        false
    }

    pub fn set_parameters(&self, params: LoopParams) -> bool {
        if self.from_loop_thread("set_parameters") {
            return false;
        }
        *lock(&self.shared.params) = params;
        true
    }

    pub fn start(&self) -> bool {
        if self.from_loop_thread("start") {
            return false;
        }
        info!("detect loop start requested");
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.gate.release();
        true
    }

    pub fn resume(&self) -> bool {
        if self.from_loop_thread("resume") {
            return false;
        }
        info!("detect loop resume requested");
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.gate.release();
        true
    }

    pub fn pause(&self) -> bool {
        if self.from_loop_thread("pause") {
            return false;
        }
        info!("detect loop pause requested");
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.gate.release();
        true
    }

    pub fn stop(&self) -> bool {
        if self.from_loop_thread("stop") {
            return false;
        }
        info!("detect loop stop requested");
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.gate.release();
        true
    }
}

pub struct DetectLoop {
    shared: Arc<Shared>,
    template: Mat,
}

impl DetectLoop {
    /// `template` is the upward marker in grayscale; the other lanes use
    /// rotations of it.
    pub fn new(template: Mat, params: LoopParams) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                gate: Gate::new(),
                params: Mutex::new(params),
                loop_thread: Mutex::new(None),
            }),
            template,
        }
    }

    pub fn control(&self) -> Control {
        Control {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("detect-loop".into())
            .spawn(move || self.run())
    }

    fn run(self) {
        *lock(&self.shared.loop_thread) = Some(thread::current().id());
        if let Err(e) = opencv::core::set_num_threads(VISION_WORKER_THREADS) {
            warn!("failed to cap vision worker threads: {e}");
        }
        info!("detect loop ready");

        while !self.shared.cancel.load(Ordering::SeqCst) {
            if !self.shared.gate.acquire_timeout(CONTROL_WAIT) {
                debug!("control wait timed out; re-checking stop flag");
                continue;
            }
            if self.shared.cancel.load(Ordering::SeqCst) {
                break;
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                continue;
            }
            let params = lock(&self.shared.params).clone();
            info!(?params, "session starting");
            let templates = match LaneTemplates::build(&self.template) {
                Ok(t) => t,
                Err(e) => {
                    error!("cannot build lane templates: {e:#}");
                    thread::sleep(SESSION_COOLDOWN);
                    continue;
                }
            };
            while self.shared.running.load(Ordering::SeqCst)
                && !self.shared.cancel.load(Ordering::SeqCst)
            {
                match Session::open(&templates, &params) {
                    Ok(mut session) => {
                        if let Err(e) = self.run_session(&mut session, params.method) {
                            error!("session aborted: {e:#}");
                        }
                    }
                    // e.g. no monitor or no input backend; retried until
                    // paused or stopped
                    Err(e) => error!("session setup failed: {e:#}"),
                }
                thread::sleep(SESSION_COOLDOWN);
            }
        }
        info!("detect loop exiting");
    }

    fn run_session(&self, session: &mut Session<'_>, method: CaptureMethod) -> Result<()> {
        let mut backend: Option<Box<dyn CaptureBackend>> = None;
        let mut fps_frames = 0u32;
        let mut fps_elapsed_ms = 0u64;

        while self.shared.running.load(Ordering::SeqCst)
            && !self.shared.cancel.load(Ordering::SeqCst)
        {
            let started = Instant::now();

            if backend.is_none() {
                info!(?method, "initializing capture backend");
                match capture::create_backend(method) {
                    Ok(b) => backend = Some(b),
                    Err(e) => {
                        // Keep retrying rather than dying; the capture API
                        // may only be briefly unavailable.
                        error!("capture backend init failed: {e}");
                        thread::sleep(SESSION_COOLDOWN);
                        continue;
                    }
                }
            }
            if let Some(b) = backend.as_mut() {
                if let Err(e) = session.frame(b.as_mut()) {
                    warn!("frame skipped: {e:#}");
                    thread::sleep(FAULT_BACKOFF);
                }
            }

            let elapsed = started.elapsed().as_millis() as u64;
            fps_elapsed_ms += elapsed;
            fps_frames += 1;
            if fps_elapsed_ms >= FPS_WINDOW_MS {
                info!(fps = fps_frames as f64 / 10.0, "capture rate");
                fps_elapsed_ms = 0;
                fps_frames = 0;
            }
            thread::sleep(Duration::from_millis(if elapsed < FRAME_BUDGET_MS {
                FRAME_BUDGET_MS - elapsed
            } else {
                FRAME_FLOOR_MS
            }));
        }
        // Backend drops here: no capture resource crosses a pause/resume
        // boundary.
        Ok(())
    }
}

/// Per-session state: the capture rectangle, calibration progress, the
/// four lane trackers and the throttle. Rebuilt on every resume.
struct Session<'a> {
    templates: &'a LaneTemplates,
    rect: Region,
    calibrator: Calibrator,
    trackers: [LaneTracker; 4],
    throttle: ComboThrottle,
    keys: Box<dyn KeyTap>,
    sink: Option<DebugSink>,
}

impl<'a> Session<'a> {
    fn open(templates: &'a LaneTemplates, params: &LoopParams) -> Result<Self> {
        let screen = capture::primary_screen_region().context("primary monitor lookup")?;
        let rect = screen.inset(params.left, params.top, params.right, params.bottom);
        ensure!(rect.is_valid(), "configured insets leave no capture area");
        let keys: Box<dyn KeyTap> =
            Box::new(EnigoKeys::new().context("input backend init")?);
        let sink = if params.save_debug {
            Some(DebugSink::new(&params.debug_dir)?)
        } else {
            None
        };
        Ok(Self {
            templates,
            rect,
            calibrator: Calibrator::new(BORDER_MATCH_COUNT),
            trackers: [
                LaneTracker::new("left"),
                LaneTracker::new("down"),
                LaneTracker::new("up"),
                LaneTracker::new("right"),
            ],
            throttle: ComboThrottle::new(params.combo_limit),
            keys,
            sink,
        })
    }

    fn frame(&mut self, backend: &mut dyn CaptureBackend) -> Result<()> {
        let frame = backend.grab(self.rect).context("screen grab")?;
        let gray = vision::gray_mat(&frame)?;
        // breathe between grabs so the backend is never saturated
        thread::sleep(Duration::from_millis(1));
        if self.calibrator.locked() {
            self.tracking_frame(gray)
        } else {
            self.calibration_frame(&frame, &gray)
        }
    }

    fn calibration_frame(&mut self, frame: &RgbaImage, gray: &Mat) -> Result<()> {
        let half = vision::halved(gray)?;
        let Some(candidate) = vision::detect_border(&half, MINIMUM_LINE_LENGTH)? else {
            // no qualifying border this frame; not an error, no vote cast
            return Ok(());
        };
        let candidate = candidate.doubled();
        if let Some(border) = self.calibrator.offer(candidate) {
            let adjusted = apply_border(self.rect, border);
            info!(
                left = adjusted.left,
                top = adjusted.top,
                right = adjusted.right,
                bottom = adjusted.bottom,
                "border locked; capture rectangle adjusted"
            );
            self.rect = adjusted;
            if let Some(sink) = self.sink.as_ref() {
                let mut color = vision::bgr_mat(frame)?;
                if let Err(e) = sink.save_border_frame(&mut color, border) {
                    warn!("border frame dump failed: {e:#}");
                }
            }
        }
        Ok(())
    }

    fn tracking_frame(&mut self, gray: Mat) -> Result<()> {
        // Transient geometry fault: the backend produced a frame that does
        // not match the rectangle we asked for. Skip it.
        if self.rect.width() != gray.cols() || self.rect.height() != gray.rows() {
            warn!(
                expected_w = self.rect.width(),
                expected_h = self.rect.height(),
                got_w = gray.cols(),
                got_h = gray.rows(),
                "captured geometry mismatch; skipping frame"
            );
            return Ok(());
        }

        let match_scale = TEMPLATE_WORKING_WIDTH / self.rect.width() as f64;
        let mut scaled = vision::scaled_nearest(&gray, match_scale)?;
        let exit_area_y = scaled.rows() - DETECT_AREA_HEIGHT;
        for tracker in &mut self.trackers {
            tracker.set_exit_area_y(exit_area_y);
        }

        let band_w = (scaled.cols() as f64 / 4.0) as i32;
        let ts = current_millis();
        let correlation_started = Instant::now();
        let mut lanes: [Vec<i32>; 4] = Default::default();
        for (i, template) in self.templates.in_lane_order().iter().enumerate() {
            let band = Rect::new(band_w * i as i32, 0, band_w, scaled.rows());
            let surface = vision::match_in_band(&scaled, template, band)?;
            lanes[i] = vision::bottom_ys(&surface, template.rows())?;
        }
        debug!(
            elapsed_ms = correlation_started.elapsed().as_millis() as u64,
            match_scale, "lane correlation done"
        );

        if self.sink.is_some() {
            info!(
                left = lanes[0].len(),
                down = lanes[1].len(),
                up = lanes[2].len(),
                right = lanes[3].len(),
                "matched counts"
            );
            for (direction, lane) in Direction::LANE_ORDER.iter().zip(&lanes) {
                debug::log_detections(direction.label(), lane);
            }
        }

        for (i, direction) in Direction::LANE_ORDER.iter().enumerate() {
            if self.trackers[i].update(&lanes[i], ts) {
                if self.throttle.allow() {
                    if let Err(e) = self.keys.tap(*direction) {
                        warn!("{e:#}");
                    }
                } else {
                    info!(lane = direction.label(), "combo limit reached; key suppressed");
                }
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            sink.save_annotated(&mut scaled, &lanes, band_w)?;
            for (direction, tracker) in Direction::LANE_ORDER.iter().zip(&self.trackers) {
                info!(lane = direction.label(), objects = %tracker.lane_dump(), "lane state");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LoopParams {
        LoopParams {
            left: 0,
            top: 0,
            right: 0,
            bottom: 0,
            method: CaptureMethod::Region,
            combo_limit: 24,
            save_debug: false,
            debug_dir: "debug".into(),
        }
    }

    #[test]
    fn test_gate_timeout_is_not_an_error() {
        let gate = Gate::new();
        assert!(!gate.acquire_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_gate_release_then_acquire() {
        let gate = Gate::new();
        gate.release();
        assert!(gate.acquire_timeout(Duration::from_millis(5)));
        // the permit was consumed
        assert!(!gate.acquire_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_start_sets_running_and_releases_gate() {
        let engine = DetectLoop::new(Mat::default(), params());
        let control = engine.control();
        assert!(control.start());
        assert!(engine.shared.running.load(Ordering::SeqCst));
        assert!(engine.shared.gate.acquire_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_pause_clears_running_without_cancel() {
        let engine = DetectLoop::new(Mat::default(), params());
        let control = engine.control();
        control.start();
        assert!(control.pause());
        assert!(!engine.shared.running.load(Ordering::SeqCst));
        assert!(!engine.shared.cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_sets_cancel() {
        let engine = DetectLoop::new(Mat::default(), params());
        let control = engine.control();
        assert!(control.stop());
        assert!(engine.shared.cancel.load(Ordering::SeqCst));
        assert!(!engine.shared.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_control_rejected_from_loop_thread() {
        let engine = DetectLoop::new(Mat::default(), params());
        let control = engine.control();
        *lock(&engine.shared.loop_thread) = Some(thread::current().id());
        assert!(!control.start());
        assert!(!control.pause());
        assert!(!control.resume());
        assert!(!control.stop());
        assert!(!control.set_parameters(params()));
        // nothing was mutated by the rejected calls
        assert!(!engine.shared.running.load(Ordering::SeqCst));
        assert!(!engine.shared.cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_parameters_swap_atomically() {
        let engine = DetectLoop::new(Mat::default(), params());
        let control = engine.control();
        let mut next = params();
        next.combo_limit = 7;
        next.method = CaptureMethod::Blit;
        assert!(control.set_parameters(next));
        let snapshot = lock(&engine.shared.params).clone();
        assert_eq!(snapshot.combo_limit, 7);
        assert_eq!(snapshot.method, CaptureMethod::Blit);
    }
}
