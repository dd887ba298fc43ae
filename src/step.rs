//! Walk-in-place step detection.
//!
//! The HMD's velocity opens a short window when it bobs vertically; the two
//! hand controllers that tick inside that window then drive a synthetic
//! touchpad (`Axis0`) so the application sees locomotion input.

use crate::types::{AxisState, ButtonEventType, DeviceClass, DeviceId, AXIS0_BUTTON};
use crate::{ManipError, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Ticks of forced release after the last touch, so the axis never sticks.
pub const UNTOUCH_TICK_LIMIT: u32 = 50;

/// Longest step window accepted, seconds.
pub const MAX_STEP_WINDOW: f64 = 5.0;

/// Step-detection request operations.
pub const STEP_OP_ENABLE: u32 = 1;
pub const STEP_OP_WINDOW: u32 = 2;
pub const STEP_OP_HMD_THRESHOLD: u32 = 3;
pub const STEP_OP_JOG_THRESHOLD: u32 = 4;
pub const STEP_OP_RUN_THRESHOLD: u32 = 5;

/// Axis y value while walking.
pub const WALK_AXIS_VALUE: f32 = 0.5;
/// Axis y value while jogging or running.
pub const JOG_AXIS_VALUE: f32 = 1.0;

/// Tuning for the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Per-axis HMD velocity thresholds (x lateral, y vertical, z forward), m/s.
    pub hmd_threshold: Vector3<f64>,
    /// Summed |vx|+|vy|+|vz| of a hand above which the step counts as jogging.
    pub jog_threshold: f64,
    /// Summed hand speed above which the step counts as running.
    pub run_threshold: f64,
    /// Seconds a detected step stays open.
    pub window: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            hmd_threshold: Vector3::new(0.13, 0.27, 0.13),
            jog_threshold: 0.40,
            run_threshold: 1.70,
            window: 0.07,
        }
    }
}

impl StepConfig {
    /// A window must be positive and at most [`MAX_STEP_WINDOW`].
    pub fn is_valid_window(seconds: f64) -> bool {
        seconds.is_finite() && seconds > 0.0 && seconds <= MAX_STEP_WINDOW
    }

    pub fn is_valid_threshold(value: f64) -> bool {
        value.is_finite() && value >= 0.0
    }

    /// Check every field. The error carries the operation that sets the bad one.
    pub fn check(&self) -> Result<()> {
        if !Self::is_valid_window(self.window) {
            return Err(ManipError::InvalidOperation(STEP_OP_WINDOW));
        }
        if !self.hmd_threshold.iter().all(|v| Self::is_valid_threshold(*v)) {
            return Err(ManipError::InvalidOperation(STEP_OP_HMD_THRESHOLD));
        }
        if !Self::is_valid_threshold(self.jog_threshold) {
            return Err(ManipError::InvalidOperation(STEP_OP_JOG_THRESHOLD));
        }
        if !Self::is_valid_threshold(self.run_threshold) {
            return Err(ManipError::InvalidOperation(STEP_OP_RUN_THRESHOLD));
        }
        Ok(())
    }
}

/// Synthetic input produced by the classifier, addressed to the ticking device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepEvent {
    Button {
        device_id: u32,
        kind: ButtonEventType,
        button: u32,
    },
    Axis {
        device_id: u32,
        axis: u32,
        state: AxisState,
    },
}

/// Vertical HMD motion that dominates the other two axes while they stay small.
pub fn is_taking_step(v: &Vector3<f64>, threshold: &Vector3<f64>) -> bool {
    v.z.abs() < threshold.z
        && v.x.abs() < threshold.x
        && ((v.y > threshold.y && v.y > v.x && v.y > v.z)
            || (v.y < -threshold.y && v.y < v.x && v.y < v.z))
}

fn hand_speed(v: &Vector3<f64>) -> f64 {
    v.x.abs() + v.y.abs() + v.z.abs()
}

pub struct StepDetector {
    config: StepConfig,
    enabled: bool,
    pending: bool,
    /// Controller slots are still accepting devices.
    slots_open: bool,
    slots: [Option<DeviceId>; 2],
    integrated: f64,
    last_tick: Option<Instant>,
    untouched_ticks: u32,
}

impl Default for StepDetector {
    fn default() -> Self {
        Self::new(StepConfig::default())
    }
}

impl StepDetector {
    pub fn new(config: StepConfig) -> Self {
        Self {
            config,
            enabled: false,
            pending: false,
            slots_open: false,
            slots: [None; 2],
            integrated: 0.0,
            last_tick: None,
            untouched_ticks: 0,
        }
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: StepConfig) -> Result<()> {
        config.check()?;
        self.config = config;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Turn the classifier on or off. Either way it starts from idle.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.reset();
        self.untouched_ticks = 0;
        self.last_tick = None;
    }

    pub fn set_window(&mut self, seconds: f64) -> Result<()> {
        if !StepConfig::is_valid_window(seconds) {
            return Err(ManipError::InvalidOperation(STEP_OP_WINDOW));
        }
        self.config.window = seconds;
        Ok(())
    }

    pub fn set_hmd_threshold(&mut self, threshold: Vector3<f64>) -> Result<()> {
        if !threshold.iter().all(|v| StepConfig::is_valid_threshold(*v)) {
            return Err(ManipError::InvalidOperation(STEP_OP_HMD_THRESHOLD));
        }
        self.config.hmd_threshold = threshold;
        Ok(())
    }

    pub fn set_jog_threshold(&mut self, threshold: f64) -> Result<()> {
        if !StepConfig::is_valid_threshold(threshold) {
            return Err(ManipError::InvalidOperation(STEP_OP_JOG_THRESHOLD));
        }
        self.config.jog_threshold = threshold;
        Ok(())
    }

    pub fn set_run_threshold(&mut self, threshold: f64) -> Result<()> {
        if !StepConfig::is_valid_threshold(threshold) {
            return Err(ManipError::InvalidOperation(STEP_OP_RUN_THRESHOLD));
        }
        self.config.run_threshold = threshold;
        Ok(())
    }

    fn reset(&mut self) {
        self.pending = false;
        self.slots_open = false;
        self.slots = [None; 2];
        self.integrated = 0.0;
    }

    fn is_jogging(&self, v: &Vector3<f64>) -> bool {
        hand_speed(v) > self.config.jog_threshold
    }

    fn is_running(&self, v: &Vector3<f64>) -> bool {
        hand_speed(v) > self.config.run_threshold
    }

    /// Feed one valid pose sample. Returns the synthetic events to forward.
    pub fn process(
        &mut self,
        device: DeviceId,
        class: DeviceClass,
        velocity: &Vector3<f64>,
        now: Instant,
    ) -> Vec<StepEvent> {
        let mut events = Vec::new();
        if !self.enabled {
            return events;
        }

        if !self.pending
            && class == DeviceClass::Hmd
            && is_taking_step(velocity, &self.config.hmd_threshold)
        {
            log::trace!("Step detected on HMD {}", device);
            self.reset();
            self.pending = true;
            self.slots_open = true;
        }

        let device_id = device.raw();
        let recorded =
            self.pending && !self.slots_open && self.slots.contains(&Some(device));
        if recorded {
            events.push(StepEvent::Button {
                device_id,
                kind: ButtonEventType::Touched,
                button: AXIS0_BUTTON,
            });
            let y = if self.is_jogging(velocity) {
                JOG_AXIS_VALUE
            } else {
                WALK_AXIS_VALUE
            };
            events.push(StepEvent::Axis {
                device_id,
                axis: 0,
                state: AxisState { x: 0.0, y },
            });
            self.untouched_ticks = 0;
            if self.is_running(velocity) {
                events.push(StepEvent::Button {
                    device_id,
                    kind: ButtonEventType::Pressed,
                    button: AXIS0_BUTTON,
                });
            }
        } else if self.untouched_ticks < UNTOUCH_TICK_LIMIT {
            events.push(StepEvent::Button {
                device_id,
                kind: ButtonEventType::Unpressed,
                button: AXIS0_BUTTON,
            });
            events.push(StepEvent::Axis {
                device_id,
                axis: 0,
                state: AxisState::default(),
            });
            events.push(StepEvent::Button {
                device_id,
                kind: ButtonEventType::Untouched,
                button: AXIS0_BUTTON,
            });
            self.untouched_ticks += 1;
        }

        if self.pending {
            if self.integrated >= self.config.window {
                log::trace!("Step window elapsed after {:.3}s", self.integrated);
                self.reset();
            } else {
                match class {
                    DeviceClass::Controller if self.slots_open => self.fill_slot(device),
                    DeviceClass::Controller => {
                        if self.is_jogging(velocity) || self.is_running(velocity) {
                            self.integrated = 0.0;
                        }
                    }
                    DeviceClass::Hmd => {
                        if is_taking_step(velocity, &self.config.hmd_threshold) {
                            self.integrated = 0.0;
                        }
                    }
                    _ => {}
                }
                if let Some(last) = self.last_tick {
                    self.integrated += now.saturating_duration_since(last).as_secs_f64();
                }
            }
        }
        self.last_tick = Some(now);

        events
    }

    fn fill_slot(&mut self, device: DeviceId) {
        match self.slots {
            [None, _] => self.slots[0] = Some(device),
            [Some(first), None] if first != device => {
                self.slots[1] = Some(device);
                self.slots_open = false;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HMD: u32 = 0;
    const LEFT: u32 = 1;
    const RIGHT: u32 = 2;

    fn id(raw: u32) -> DeviceId {
        DeviceId::new(raw).unwrap()
    }

    fn touched(events: &[StepEvent]) -> bool {
        events.iter().any(|e| {
            matches!(
                e,
                StepEvent::Button {
                    kind: ButtonEventType::Touched,
                    ..
                }
            )
        })
    }

    fn pressed(events: &[StepEvent]) -> bool {
        events.iter().any(|e| {
            matches!(
                e,
                StepEvent::Button {
                    kind: ButtonEventType::Pressed,
                    ..
                }
            )
        })
    }

    fn axis_y(events: &[StepEvent]) -> Option<f32> {
        events.iter().find_map(|e| match e {
            StepEvent::Axis { state, .. } => Some(state.y),
            _ => None,
        })
    }

    fn enabled_detector() -> StepDetector {
        let mut detector = StepDetector::default();
        detector.set_enabled(true);
        detector
    }

    #[test]
    fn test_take_step_classification() {
        let threshold = Vector3::new(0.05, 0.5, 0.05);
        assert!(is_taking_step(&Vector3::new(0.01, 0.9, 0.02), &threshold));
        assert!(!is_taking_step(&Vector3::new(0.6, 0.9, 0.02), &threshold));
        assert!(is_taking_step(&Vector3::new(0.01, -0.9, 0.02), &threshold));
        assert!(!is_taking_step(&Vector3::new(0.01, 0.3, 0.02), &threshold));
    }

    #[test]
    fn test_disabled_emits_nothing() {
        let mut detector = StepDetector::default();
        let events = detector.process(id(HMD), DeviceClass::Hmd, &Vector3::new(0.0, 0.5, 0.0), Instant::now());
        assert!(events.is_empty());
        assert!(!detector.is_pending());
    }

    #[test]
    fn test_step_drives_both_hands() {
        let mut detector = enabled_detector();
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);
        let still = Vector3::zeros();
        let walking_hand = Vector3::new(0.1, 0.1, 0.1);

        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::new(0.0, 0.5, 0.0), ms(0));
        assert!(detector.is_pending());

        // The first two controllers to tick take the slots.
        let fill_left = detector.process(id(LEFT), DeviceClass::Controller, &still, ms(5));
        assert!(!touched(&fill_left));
        detector.process(id(RIGHT), DeviceClass::Controller, &still, ms(10));

        let left = detector.process(id(LEFT), DeviceClass::Controller, &walking_hand, ms(15));
        assert!(touched(&left));
        assert_eq!(axis_y(&left), Some(WALK_AXIS_VALUE));
        assert!(!pressed(&left));

        let right = detector.process(id(RIGHT), DeviceClass::Controller, &walking_hand, ms(20));
        assert!(touched(&right));

        // The HMD is not one of the slots.
        let hmd = detector.process(id(HMD), DeviceClass::Hmd, &still, ms(25));
        assert!(!touched(&hmd));
    }

    #[test]
    fn test_jog_and_run_levels() {
        let mut detector = enabled_detector();
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);

        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::new(0.0, 0.5, 0.0), ms(0));
        detector.process(id(LEFT), DeviceClass::Controller, &Vector3::zeros(), ms(1));
        detector.process(id(RIGHT), DeviceClass::Controller, &Vector3::zeros(), ms(2));

        let jog = detector.process(id(LEFT), DeviceClass::Controller, &Vector3::new(0.3, 0.2, 0.0), ms(3));
        assert_eq!(axis_y(&jog), Some(JOG_AXIS_VALUE));
        assert!(!pressed(&jog));

        let run = detector.process(id(RIGHT), DeviceClass::Controller, &Vector3::new(1.0, 0.5, 0.5), ms(4));
        assert_eq!(axis_y(&run), Some(JOG_AXIS_VALUE));
        assert!(pressed(&run));
    }

    #[test]
    fn test_window_elapses_and_releases_axis() {
        let mut detector = enabled_detector();
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);
        let still = Vector3::zeros();

        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::new(0.0, 0.5, 0.0), ms(0));
        detector.process(id(LEFT), DeviceClass::Controller, &still, ms(10));
        detector.process(id(RIGHT), DeviceClass::Controller, &still, ms(20));
        assert!(touched(&detector.process(id(LEFT), DeviceClass::Controller, &still, ms(40))));
        // The window is used up here; the next tick still touches, then resolves.
        assert!(touched(&detector.process(id(LEFT), DeviceClass::Controller, &still, ms(80))));
        assert!(touched(&detector.process(id(LEFT), DeviceClass::Controller, &still, ms(90))));
        assert!(!detector.is_pending());

        let released = detector.process(id(LEFT), DeviceClass::Controller, &still, ms(100));
        assert!(!touched(&released));
        assert_eq!(
            released,
            vec![
                StepEvent::Button { device_id: LEFT, kind: ButtonEventType::Unpressed, button: AXIS0_BUTTON },
                StepEvent::Axis { device_id: LEFT, axis: 0, state: AxisState::default() },
                StepEvent::Button { device_id: LEFT, kind: ButtonEventType::Untouched, button: AXIS0_BUTTON },
            ]
        );
    }

    #[test]
    fn test_release_stops_after_limit() {
        let mut detector = enabled_detector();
        let t0 = Instant::now();
        for n in 0..UNTOUCH_TICK_LIMIT {
            let events = detector.process(id(LEFT), DeviceClass::Controller, &Vector3::zeros(), t0 + Duration::from_millis(n as u64));
            assert_eq!(events.len(), 3);
        }
        let quiet = detector.process(id(LEFT), DeviceClass::Controller, &Vector3::zeros(), t0 + Duration::from_secs(1));
        assert!(quiet.is_empty());
    }

    #[test]
    fn test_second_hmd_step_restarts_window() {
        let mut detector = enabled_detector();
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);
        let step = Vector3::new(0.0, 0.5, 0.0);

        detector.process(id(HMD), DeviceClass::Hmd, &step, ms(0));
        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::zeros(), ms(50));
        // Another step before the window closes.
        detector.process(id(HMD), DeviceClass::Hmd, &step, ms(60));
        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::zeros(), ms(100));
        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::zeros(), ms(140));
        assert!(detector.is_pending());
        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::zeros(), ms(150));
        assert!(!detector.is_pending());
    }

    #[test]
    fn test_disable_resets_to_idle() {
        let mut detector = enabled_detector();
        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::new(0.0, 0.5, 0.0), Instant::now());
        assert!(detector.is_pending());
        detector.set_enabled(false);
        assert!(!detector.is_pending());
        detector.set_enabled(true);
        assert!(!detector.is_pending());
    }

    #[test]
    fn test_same_controller_fills_one_slot() {
        let mut detector = enabled_detector();
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);

        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::new(0.0, 0.5, 0.0), ms(0));
        detector.process(id(LEFT), DeviceClass::Controller, &Vector3::zeros(), ms(1));
        detector.process(id(LEFT), DeviceClass::Controller, &Vector3::zeros(), ms(2));
        // Slots are still open, so nothing touches yet.
        assert!(!touched(&detector.process(id(LEFT), DeviceClass::Controller, &Vector3::zeros(), ms(3))));
    }

    #[test]
    fn test_bad_tuning_is_rejected() {
        let mut detector = enabled_detector();
        let before = *detector.config();
        for window in [f64::NAN, f64::INFINITY, -0.1, 0.0, MAX_STEP_WINDOW + 1.0] {
            assert_eq!(
                detector.set_window(window),
                Err(ManipError::InvalidOperation(STEP_OP_WINDOW))
            );
        }
        for value in [f64::NAN, -1.0] {
            assert_eq!(
                detector.set_jog_threshold(value),
                Err(ManipError::InvalidOperation(STEP_OP_JOG_THRESHOLD))
            );
            assert_eq!(
                detector.set_run_threshold(value),
                Err(ManipError::InvalidOperation(STEP_OP_RUN_THRESHOLD))
            );
            assert_eq!(
                detector.set_hmd_threshold(Vector3::new(0.1, value, 0.1)),
                Err(ManipError::InvalidOperation(STEP_OP_HMD_THRESHOLD))
            );
        }
        let config = StepConfig {
            run_threshold: f64::NAN,
            ..StepConfig::default()
        };
        assert!(detector.set_config(config).is_err());
        assert_eq!(*detector.config(), before);
        detector.set_window(MAX_STEP_WINDOW).unwrap();
    }

    #[test]
    fn test_pending_step_resolves_after_rejected_window() {
        let mut detector = enabled_detector();
        assert!(detector.set_window(f64::NAN).is_err());
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);

        detector.process(id(HMD), DeviceClass::Hmd, &Vector3::new(0.0, 0.5, 0.0), ms(0));
        detector.process(id(LEFT), DeviceClass::Controller, &Vector3::zeros(), ms(5));
        detector.process(id(RIGHT), DeviceClass::Controller, &Vector3::zeros(), ms(10));
        for n in 1..=80 {
            detector.process(id(LEFT), DeviceClass::Controller, &Vector3::zeros(), ms(10 + n * 10));
        }
        assert!(!detector.is_pending());
    }
}
