//! Camera detection gate.
//!
//! One physical presentation of a label produces many camera detections. The
//! guard turns that stream into at most one logical scan per barcode:
//!
//! - **Readiness**: nothing is accepted until the post-open countdown elapses.
//! - **Geometry**: the detection's bounding-box center must fall inside the
//!   on-screen scan frame, expanded by a tolerance margin.
//! - **Processing set**: a barcode whose scan is still in flight is dropped.
//! - **Cooldown**: the same barcode seen again inside the window is dropped.
//!
//! All rejections are silent (logged at `debug`). Admission hands back a
//! [`ProcessingTicket`]; dropping it releases the barcode on every exit path.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default cooldown between two accepted detections of the same barcode.
pub const DEFAULT_COOLDOWN_MS: u64 = 2_000;
/// Default post-open countdown before detections are accepted.
pub const DEFAULT_COUNTDOWN_SECS: u64 = 3;
/// Default margin added on each side of the frame, as a fraction of its size.
pub const DEFAULT_FRAME_TOLERANCE: f64 = 0.2;

/// Axis-aligned rectangle in screen points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Grow by `tolerance * size` on each side of each axis.
    pub fn expanded(&self, tolerance: f64) -> Self {
        let dx = self.width * tolerance;
        let dy = self.height * tolerance;
        Self {
            x: self.x - dx,
            y: self.y - dy,
            width: self.width + 2.0 * dx,
            height: self.height + 2.0 * dy,
        }
    }

    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }
}

/// Screen dimensions, used for the fallback frame and normalized boxes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: f64,
    pub height: f64,
}

impl ScreenSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Centered frame, 70% of the width by 30% of the height.
    pub fn fallback_frame(&self) -> Rect {
        let width = self.width * 0.7;
        let height = self.height * 0.3;
        Rect::new(
            (self.width - width) / 2.0,
            (self.height - height) / 2.0,
            width,
            height,
        )
    }
}

/// A raw camera (or serial/manual) detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub barcode: String,
    /// Reported bounding box; `None` for sources without geometry.
    pub bounds: Option<Rect>,
    pub detected_at: DateTime<Utc>,
}

impl Detection {
    pub fn new(barcode: impl Into<String>, detected_at: DateTime<Utc>) -> Self {
        Self {
            barcode: barcode.into(),
            bounds: None,
            detected_at,
        }
    }

    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = Some(bounds);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebounceConfig {
    pub cooldown_ms: u64,
    pub countdown_secs: u64,
    pub frame_tolerance: f64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            countdown_secs: DEFAULT_COUNTDOWN_SECS,
            frame_tolerance: DEFAULT_FRAME_TOLERANCE,
        }
    }
}

impl DebounceConfig {
    /// Values past chrono's range saturate to [`Duration::MAX`].
    fn cooldown(&self) -> Duration {
        i64::try_from(self.cooldown_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .unwrap_or(Duration::MAX)
    }

    fn countdown(&self) -> Duration {
        i64::try_from(self.countdown_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }
}

/// Scanner lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerPhase {
    /// Camera closed.
    Idle,
    /// Camera open, stabilizing until `ready_at`.
    CountdownActive { ready_at: DateTime<Utc> },
    Accepting,
    /// At least one barcode in flight; `barcode` is the most recently admitted.
    Processing { barcode: String },
}

/// Why a detection was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Camera closed or countdown still running.
    NotReady,
    Empty,
    OutsideFrame,
    AlreadyProcessing,
    Cooldown,
}

#[derive(Debug)]
struct GuardState {
    phase: ScannerPhase,
    last_seen: Option<(String, DateTime<Utc>)>,
    processing: HashSet<String>,
    frame: Option<Rect>,
    screen: ScreenSize,
}

impl GuardState {
    /// Advance `CountdownActive` to `Accepting` once `now` has reached `ready_at`.
    fn settle(&mut self, now: DateTime<Utc>) {
        if let ScannerPhase::CountdownActive { ready_at } = self.phase {
            if now >= ready_at {
                self.phase = ScannerPhase::Accepting;
            }
        }
    }
}

/// Debounce/dedup gate in front of the validator.
#[derive(Debug)]
pub struct ScanDebounceGuard {
    config: DebounceConfig,
    state: Mutex<GuardState>,
}

impl ScanDebounceGuard {
    pub fn new(config: DebounceConfig, screen: ScreenSize) -> Self {
        Self {
            config,
            state: Mutex::new(GuardState {
                phase: ScannerPhase::Idle,
                last_seen: None,
                processing: HashSet::new(),
                frame: None,
                screen,
            }),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Camera opened: start the stabilization countdown.
    pub fn open(&self, now: DateTime<Utc>) {
        let mut state = self.state();
        let ready_at = now
            .checked_add_signed(self.config.countdown())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.phase = ScannerPhase::CountdownActive { ready_at };
        state.last_seen = None;
        tracing::debug!(%ready_at, "scanner opened; countdown started");
    }

    /// Camera closed: drop everything except the measured frame.
    pub fn close(&self) {
        let mut state = self.state();
        state.phase = ScannerPhase::Idle;
        state.last_seen = None;
        state.processing.clear();
        tracing::debug!("scanner closed");
    }

    /// Record the measured on-screen frame rectangle.
    pub fn set_frame(&self, frame: Rect) {
        self.state().frame = Some(frame);
    }

    pub fn set_screen(&self, screen: ScreenSize) {
        self.state().screen = screen;
    }

    /// Current lifecycle phase, as of `now`.
    pub fn phase(&self, now: DateTime<Utc>) -> ScannerPhase {
        let mut state = self.state();
        state.settle(now);
        state.phase.clone()
    }

    /// Seconds left on the countdown (0 once accepting).
    pub fn countdown_remaining(&self, now: DateTime<Utc>) -> u64 {
        match self.phase(now) {
            ScannerPhase::CountdownActive { ready_at } => {
                let millis = u64::try_from((ready_at - now).num_milliseconds()).unwrap_or(0);
                millis.div_ceil(1000)
            }
            _ => 0,
        }
    }

    pub fn is_processing(&self, barcode: &str) -> bool {
        self.state().processing.contains(barcode.trim())
    }

    /// Run a camera detection through every gate.
    ///
    /// On success the barcode is already in the processing set when this
    /// returns; it leaves the set when the ticket is dropped.
    pub fn admit(&self, detection: &Detection) -> Result<ProcessingTicket<'_>, Rejection> {
        let barcode = detection.barcode.trim();
        let now = detection.detected_at;
        let mut state = self.state();
        state.settle(now);

        let result = self.check(&state, barcode, detection.bounds, now);
        if let Err(rejection) = result {
            tracing::debug!(barcode, ?rejection, "detection dropped");
            return Err(rejection);
        }

        state.last_seen = Some((barcode.to_string(), now));
        Ok(self.enter(&mut state, barcode))
    }

    /// Admit a manually typed barcode. Only the processing-set gate applies.
    pub fn admit_manual(&self, barcode: &str) -> Result<ProcessingTicket<'_>, Rejection> {
        let barcode = barcode.trim();
        if barcode.is_empty() {
            return Err(Rejection::Empty);
        }
        let mut state = self.state();
        if state.processing.contains(barcode) {
            tracing::debug!(barcode, "manual entry dropped; already processing");
            return Err(Rejection::AlreadyProcessing);
        }
        Ok(self.enter(&mut state, barcode))
    }

    fn check(
        &self,
        state: &GuardState,
        barcode: &str,
        bounds: Option<Rect>,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        match state.phase {
            ScannerPhase::Idle | ScannerPhase::CountdownActive { .. } => {
                return Err(Rejection::NotReady);
            }
            ScannerPhase::Accepting | ScannerPhase::Processing { .. } => {}
        }

        if barcode.is_empty() {
            return Err(Rejection::Empty);
        }

        if let Some(bounds) = bounds {
            if !self.in_frame(state, bounds) {
                return Err(Rejection::OutsideFrame);
            }
        }

        if state.processing.contains(barcode) {
            return Err(Rejection::AlreadyProcessing);
        }

        if let Some((last, at)) = &state.last_seen {
            if last == barcode && now - *at < self.config.cooldown() {
                return Err(Rejection::Cooldown);
            }
        }

        Ok(())
    }

    fn in_frame(&self, state: &GuardState, bounds: Rect) -> bool {
        let frame = state
            .frame
            .unwrap_or_else(|| state.screen.fallback_frame())
            .expanded(self.config.frame_tolerance);

        let (mut cx, mut cy) = bounds.center();
        // Some camera stacks report boxes normalized to 0..1.
        if cx <= 1.0 && cy <= 1.0 {
            cx *= state.screen.width;
            cy *= state.screen.height;
        }
        frame.contains(cx, cy)
    }

    fn enter(&self, state: &mut GuardState, barcode: &str) -> ProcessingTicket<'_> {
        state.processing.insert(barcode.to_string());
        if state.phase != ScannerPhase::Idle {
            state.phase = ScannerPhase::Processing {
                barcode: barcode.to_string(),
            };
        }
        ProcessingTicket {
            guard: self,
            barcode: barcode.to_string(),
        }
    }

    fn release(&self, barcode: &str) {
        let mut state = self.state();
        state.processing.remove(barcode);
        if state.processing.is_empty() {
            if let ScannerPhase::Processing { .. } = state.phase {
                state.phase = ScannerPhase::Accepting;
            }
        }
    }
}

/// Holds a barcode in the processing set until dropped.
#[derive(Debug)]
#[must_use = "dropping the ticket immediately releases the barcode"]
pub struct ProcessingTicket<'a> {
    guard: &'a ScanDebounceGuard,
    barcode: String,
}

impl ProcessingTicket<'_> {
    pub fn barcode(&self) -> &str {
        &self.barcode
    }
}

impl Drop for ProcessingTicket<'_> {
    fn drop(&mut self) {
        self.guard.release(&self.barcode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    fn ready_guard() -> ScanDebounceGuard {
        let guard = ScanDebounceGuard::new(DebounceConfig::default(), ScreenSize::new(400.0, 800.0));
        guard.open(t0());
        guard
    }

    fn ready_at() -> DateTime<Utc> {
        t0() + Duration::seconds(3)
    }

    #[test]
    fn detections_are_ignored_until_countdown_elapses() {
        let guard = ready_guard();
        let early = Detection::new("123456789", t0() + ms(2_999));
        assert_eq!(guard.admit(&early).unwrap_err(), Rejection::NotReady);
        assert_eq!(guard.countdown_remaining(t0() + ms(1_500)), 2);

        let on_tick = Detection::new("123456789", ready_at());
        assert!(guard.admit(&on_tick).is_ok());
    }

    #[test]
    fn oversized_timings_saturate_instead_of_wrapping() {
        let config = DebounceConfig {
            cooldown_ms: u64::MAX,
            countdown_secs: u64::MAX,
            frame_tolerance: DEFAULT_FRAME_TOLERANCE,
        };
        assert_eq!(config.cooldown(), Duration::MAX);
        assert_eq!(config.countdown(), Duration::MAX);

        let guard = ScanDebounceGuard::new(config, ScreenSize::new(400.0, 800.0));
        guard.open(t0());
        let detection = Detection::new("123456789", t0() + Duration::days(365));
        assert_eq!(guard.admit(&detection).unwrap_err(), Rejection::NotReady);
    }

    #[test]
    fn closed_scanner_accepts_nothing() {
        let guard = ScanDebounceGuard::new(DebounceConfig::default(), ScreenSize::new(400.0, 800.0));
        let detection = Detection::new("123456789", t0());
        assert_eq!(guard.admit(&detection).unwrap_err(), Rejection::NotReady);
        assert_eq!(guard.phase(t0()), ScannerPhase::Idle);
    }

    #[test]
    fn same_barcode_inside_cooldown_is_dropped() {
        let guard = ready_guard();
        drop(guard.admit(&Detection::new("123456789", ready_at())).unwrap());

        let again = Detection::new("123456789", ready_at() + ms(1_999));
        assert_eq!(guard.admit(&again).unwrap_err(), Rejection::Cooldown);

        let later = Detection::new("123456789", ready_at() + ms(2_000));
        assert!(guard.admit(&later).is_ok());
    }

    #[test]
    fn different_barcode_is_not_subject_to_cooldown() {
        let guard = ready_guard();
        drop(guard.admit(&Detection::new("123456789", ready_at())).unwrap());
        assert!(guard.admit(&Detection::new("987654321", ready_at() + ms(10))).is_ok());
    }

    #[test]
    fn barcode_in_flight_is_dropped_and_released_on_drop() {
        let guard = ready_guard();
        let ticket = guard.admit(&Detection::new("123456789", ready_at())).unwrap();
        assert!(guard.is_processing("123456789"));
        assert_eq!(
            guard.phase(ready_at()),
            ScannerPhase::Processing {
                barcode: "123456789".into()
            }
        );

        let again = Detection::new("123456789", ready_at() + ms(5_000));
        assert_eq!(guard.admit(&again).unwrap_err(), Rejection::AlreadyProcessing);
        assert_eq!(guard.admit_manual("123456789").unwrap_err(), Rejection::AlreadyProcessing);

        drop(ticket);
        assert!(!guard.is_processing("123456789"));
        assert_eq!(guard.phase(ready_at()), ScannerPhase::Accepting);
        assert!(guard.admit(&again).is_ok());
    }

    #[test]
    fn fallback_frame_is_used_until_measured() {
        let guard = ready_guard();
        // Fallback frame on 400x800: x 60..340, y 280..520; tolerance widens it.
        let centered = Detection::new("123456789", ready_at()).with_bounds(Rect::new(180.0, 380.0, 40.0, 40.0));
        assert!(guard.admit(&centered).is_ok());

        let corner = Detection::new("987654321", ready_at()).with_bounds(Rect::new(0.0, 0.0, 20.0, 20.0));
        assert_eq!(guard.admit(&corner).unwrap_err(), Rejection::OutsideFrame);
    }

    #[test]
    fn measured_frame_honours_tolerance_margin() {
        let guard = ready_guard();
        guard.set_frame(Rect::new(100.0, 100.0, 200.0, 100.0));

        // Center at (330, 150): outside the raw frame, inside +20% (x up to 340).
        let near = Detection::new("111111111", ready_at()).with_bounds(Rect::new(320.0, 140.0, 20.0, 20.0));
        assert!(guard.admit(&near).is_ok());

        // Center at (350, 150): beyond the margin.
        let far = Detection::new("222222222", ready_at()).with_bounds(Rect::new(340.0, 140.0, 20.0, 20.0));
        assert_eq!(guard.admit(&far).unwrap_err(), Rejection::OutsideFrame);
    }

    #[test]
    fn normalized_bounds_are_scaled_to_screen() {
        let guard = ready_guard();
        let normalized = Detection::new("123456789", ready_at()).with_bounds(Rect::new(0.45, 0.45, 0.1, 0.1));
        assert!(guard.admit(&normalized).is_ok());
    }

    #[test]
    fn manual_entry_skips_readiness_and_cooldown() {
        let guard = ScanDebounceGuard::new(DebounceConfig::default(), ScreenSize::new(400.0, 800.0));
        drop(guard.admit_manual(" 123456789 ").unwrap());
        drop(guard.admit_manual("123456789").unwrap());
        assert_eq!(guard.admit_manual("  ").unwrap_err(), Rejection::Empty);
    }

    #[test]
    fn close_clears_processing_state() {
        let guard = ready_guard();
        let ticket = guard.admit(&Detection::new("123456789", ready_at())).unwrap();
        guard.close();
        assert!(!guard.is_processing("123456789"));
        drop(ticket);
        assert_eq!(guard.phase(ready_at()), ScannerPhase::Idle);
    }

    proptest! {
        #[test]
        fn repeat_inside_cooldown_never_admits(
            serial in "[0-9]{9}",
            offset in 0i64..2_000,
        ) {
            let guard = ready_guard();
            drop(guard.admit(&Detection::new(serial.clone(), ready_at())).unwrap());
            let repeat = Detection::new(serial, ready_at() + ms(offset));
            prop_assert!(guard.admit(&repeat).is_err());
        }
    }
}
