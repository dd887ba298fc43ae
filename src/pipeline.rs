//! Per-event path from the host (or an injecting client) back to the host.
//!
//! Every entry point resolves the owning record, copies out what it needs
//! under the registry lock and does the math and the host call unlocked.
//! Unknown device ids pass through unmodified.

use crate::engine::Engine;
use crate::error::HostError;
use crate::registry::CompensationFrame;
use crate::step::StepEvent;
use crate::types::{
    AxisEvent, AxisState, ButtonEvent, ButtonEventType, DeviceClass, DeviceId, DeviceMode,
    DeviceOffsets, Pose,
};
use nalgebra::UnitQuaternion;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Seconds between a sender's `timestamp` and `now`, both in epoch ms.
///
/// Unstamped (0) and future timestamps count as no latency.
pub fn latency_seconds(timestamp: i64, now: i64) -> f64 {
    if timestamp <= 0 || now <= timestamp {
        return 0.0;
    }
    (now - timestamp) as f64 / 1000.0
}

/// Log and drop a host failure.
pub(crate) fn forward(what: &str, result: Result<(), HostError>) {
    if let Err(e) = result {
        log::warn!("Host rejected {}: {}", what, e);
    }
}

/// Apply enabled offsets: device-local, then driver-from-head, then world-from-driver.
pub fn apply_offsets(pose: &mut Pose, offsets: &DeviceOffsets) {
    // Invalid poses may carry a zero rotation; leave their position alone.
    if let Some(rotation) = UnitQuaternion::try_new(pose.rotation, f64::EPSILON) {
        pose.position += rotation * offsets.device_translation;
    }
    pose.rotation = pose.rotation * offsets.device_rotation;

    pose.driver_from_head_rotation =
        pose.driver_from_head_rotation * offsets.driver_from_head_rotation;
    pose.driver_from_head_translation += offsets.driver_from_head_translation;

    pose.world_from_driver_rotation =
        offsets.world_from_driver_rotation * pose.world_from_driver_rotation;
    pose.world_from_driver_translation += offsets.world_from_driver_translation;
}

/// What a pose needs, copied out of the registry.
struct PoseRoute {
    target: u32,
    offsets: Option<DeviceOffsets>,
    compensation: Option<CompensationFrame>,
    step: Option<(DeviceId, DeviceClass)>,
}

impl PoseRoute {
    fn passthrough(raw: u32) -> Self {
        Self {
            target: raw,
            offsets: None,
            compensation: None,
            step: None,
        }
    }
}

/// Where a hardware event from a device should go. `None` drops it.
fn routed_id(mode: DeviceMode, partner: Option<DeviceId>, suspended: bool, raw: u32) -> Option<u32> {
    match (mode, partner) {
        (DeviceMode::Disabled, _) => None,
        (DeviceMode::Redirect, _) if suspended => None,
        (DeviceMode::Redirect | DeviceMode::Swap, Some(partner)) => Some(partner.raw()),
        _ => Some(raw),
    }
}

impl Engine {
    /// Resolve routing for a pose and feed the compensation reference.
    /// `None` drops the pose.
    fn route_pose(&self, raw: u32, pose: &Pose) -> Option<PoseRoute> {
        let mut devices = self.devices.lock();
        let Some(record) = devices.find(raw) else {
            return Some(PoseRoute::passthrough(raw));
        };
        let target = routed_id(record.mode(), record.partner(), record.is_suspended(), raw)?;
        let id = record.id();
        let offsets = record.offsets_enabled().then(|| *record.offsets());
        let step = (record.step_detection_enabled() && pose.pose_is_valid)
            .then(|| (id, record.class()));

        let compensation = match devices.motion().reference() {
            Some(reference) if reference == id => {
                devices.motion_mut().capture(pose);
                None
            }
            Some(_) => devices.motion().frame(),
            None => None,
        };
        Some(PoseRoute {
            target,
            offsets,
            compensation,
            step,
        })
    }

    /// Host pose update for device `raw`.
    pub fn pose_updated(&self, raw: u32, pose: &Pose) {
        let Some(route) = self.route_pose(raw, pose) else {
            return;
        };

        let mut out = *pose;
        if let Some(frame) = route.compensation {
            frame.apply(&mut out);
        }
        if let Some(offsets) = route.offsets {
            apply_offsets(&mut out, &offsets);
        }
        forward("pose", self.host.pose_updated(route.target, &out));

        if let Some((id, class)) = route.step {
            let events = self
                .steps
                .lock()
                .process(id, class, &pose.velocity, Instant::now());
            for event in events {
                match event {
                    StepEvent::Button {
                        device_id,
                        kind,
                        button,
                    } => forward(
                        "step button",
                        self.host.button_event(device_id, kind, button, 0.0),
                    ),
                    StepEvent::Axis {
                        device_id,
                        axis,
                        state,
                    } => forward("step axis", self.host.axis_updated(device_id, axis, state)),
                }
            }
        }
    }

    /// Host button event. Mapping applies before routing.
    pub fn button_event(&self, raw: u32, kind: ButtonEventType, button: u32, time_offset: f64) {
        let routed = {
            let devices = self.devices.lock();
            match devices.find(raw) {
                None => Some((raw, button)),
                Some(record) => {
                    routed_id(record.mode(), record.partner(), record.is_suspended(), raw)
                        .map(|target| (target, record.map_button(button)))
                }
            }
        };
        if let Some((target, button)) = routed {
            forward(
                "button event",
                self.host.button_event(target, kind, button, time_offset),
            );
        }
    }

    pub fn axis_updated(&self, raw: u32, axis: u32, state: AxisState) {
        let target = {
            let devices = self.devices.lock();
            match devices.find(raw) {
                None => Some(raw),
                Some(record) => {
                    routed_id(record.mode(), record.partner(), record.is_suspended(), raw)
                }
            }
        };
        if let Some(target) = target {
            forward("axis update", self.host.axis_updated(target, axis, state));
        }
    }

    /// Haptic request from the runtime for device `raw`, routed to the
    /// hardware that currently plays that device.
    pub fn haptic_pulse(&self, raw: u32, axis: u32, duration_micros: u16) {
        let target = self.devices.lock().haptic_target(raw);
        match target {
            Some(target) => forward(
                "haptic pulse",
                self.host.haptic_pulse(target, axis, duration_micros),
            ),
            None => log::trace!("Dropped haptic pulse for device {}", raw),
        }
    }

    /// Client-injected pose, stamped by the sender at `timestamp` ms.
    pub fn inject_pose(&self, raw: u32, pose: &Pose, timestamp: i64) {
        let mut pose = *pose;
        pose.time_offset -= latency_seconds(timestamp, now_millis());
        self.pose_updated(raw, &pose);
    }

    pub fn inject_button_events(&self, events: &[ButtonEvent]) {
        for e in events {
            self.button_event(e.device_id, e.kind, e.button, e.time_offset);
        }
    }

    pub fn inject_axis_events(&self, events: &[AxisEvent]) {
        for e in events {
            self.axis_updated(e.device_id, e.axis, e.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{activate, engine, HostCall};
    use crate::protocol::StepDetectionRequest;
    use crate::types::{rotation_from_yaw_pitch_roll_deg, OffsetUpdate, Toggle, AXIS0_BUTTON};
    use nalgebra::{Quaternion, Vector3};

    fn assert_close(a: Vector3<f64>, b: Vector3<f64>) {
        assert!((a - b).norm() < 1e-9, "{:?} != {:?}", a, b);
    }

    fn forwarded_pose(calls: &[HostCall]) -> (u32, Pose) {
        match calls {
            [HostCall::Pose(id, pose), ..] => (*id, *pose),
            other => panic!("expected a pose first, got {:?}", other),
        }
    }

    #[test]
    fn test_latency() {
        assert_eq!(latency_seconds(1_000, 1_250), 0.25);
        assert_eq!(latency_seconds(1_250, 1_000), 0.0);
        assert_eq!(latency_seconds(0, 1_000), 0.0);
    }

    #[test]
    fn test_unknown_device_passes_through() {
        let (engine, host) = engine();
        let pose = Pose {
            position: Vector3::new(1.0, 0.0, 0.0),
            ..Pose::default()
        };
        engine.pose_updated(12, &pose);
        engine.pose_updated(500, &pose);
        engine.button_event(12, ButtonEventType::Pressed, 2, 0.0);
        assert_eq!(
            host.take(),
            vec![
                HostCall::Pose(12, pose),
                HostCall::Pose(500, pose),
                HostCall::Button(12, ButtonEventType::Pressed, 2, 0.0),
            ]
        );
    }

    #[test]
    fn test_offsets_disabled_is_identity() {
        let (engine, host) = engine();
        activate(&engine, 1, DeviceClass::Controller, false);
        let mut values = DeviceOffsets::default();
        values.device_translation = Vector3::new(0.0, 0.0, 1.0);
        engine
            .set_device_offsets(1, 0, Toggle::Unchanged, &OffsetUpdate::all(values))
            .unwrap();
        let pose = Pose {
            position: Vector3::new(0.5, 1.5, -2.0),
            rotation: rotation_from_yaw_pitch_roll_deg(30.0, 0.0, 0.0),
            ..Pose::default()
        };
        engine.pose_updated(1, &pose);
        assert_eq!(host.take(), vec![HostCall::Pose(1, pose)]);
    }

    #[test]
    fn test_zero_rotation_pose_stays_finite() {
        let (engine, host) = engine();
        activate(&engine, 2, DeviceClass::Controller, false);
        let mut values = DeviceOffsets::default();
        values.world_from_driver_translation = Vector3::new(0.0, 1.0, 0.0);
        values.device_translation = Vector3::new(0.0, 0.0, 0.2);
        engine
            .set_device_offsets(2, 0, Toggle::Enable, &OffsetUpdate::all(values))
            .unwrap();

        let pose = Pose {
            rotation: Quaternion::new(0.0, 0.0, 0.0, 0.0),
            position: Vector3::new(0.3, 0.4, 0.5),
            pose_is_valid: false,
            ..Pose::default()
        };
        engine.pose_updated(2, &pose);
        let (id, out) = forwarded_pose(&host.take());
        assert_eq!(id, 2);
        assert_eq!(out.position, pose.position);
        assert_eq!(out.world_from_driver_translation, Vector3::new(0.0, 1.0, 0.0));
        assert!(!out.pose_is_valid);
    }

    #[test]
    fn test_offsets_applied_in_order() {
        let mut pose = Pose {
            rotation: rotation_from_yaw_pitch_roll_deg(90.0, 0.0, 0.0),
            ..Pose::default()
        };
        let offsets = DeviceOffsets {
            device_translation: Vector3::new(0.0, 0.0, 1.0),
            world_from_driver_translation: Vector3::new(0.0, 2.0, 0.0),
            driver_from_head_translation: Vector3::new(0.0, 0.0, 0.1),
            world_from_driver_rotation: rotation_from_yaw_pitch_roll_deg(0.0, 0.0, 90.0),
            ..DeviceOffsets::default()
        };
        apply_offsets(&mut pose, &offsets);
        // +90° yaw turns local +Z into driver +X.
        assert_close(pose.position, Vector3::new(1.0, 0.0, 0.0));
        assert_close(pose.world_from_driver_translation, Vector3::new(0.0, 2.0, 0.0));
        assert_close(pose.driver_from_head_translation, Vector3::new(0.0, 0.0, 0.1));
        assert_eq!(
            pose.world_from_driver_rotation,
            offsets.world_from_driver_rotation * Quaternion::identity()
        );
    }

    #[test]
    fn test_disabled_drops_everything() {
        let (engine, host) = engine();
        activate(&engine, 1, DeviceClass::Controller, true);
        engine.set_fake_disconnected(1).unwrap();
        engine.pose_updated(1, &Pose::default());
        engine.button_event(1, ButtonEventType::Pressed, 1, 0.0);
        engine.axis_updated(1, 0, AxisState { x: 1.0, y: 0.0 });
        engine.haptic_pulse(1, 0, 100);
        assert!(host.take().is_empty());
    }

    #[test]
    fn test_redirect_routes_source_and_silences_sink() {
        let (engine, host) = engine();
        activate(&engine, 1, DeviceClass::Controller, true);
        activate(&engine, 2, DeviceClass::Controller, true);
        engine.set_redirect(1, 2).unwrap();

        let source_pose = Pose {
            position: Vector3::new(1.0, 0.0, 0.0),
            ..Pose::default()
        };
        engine.pose_updated(1, &source_pose);
        engine.pose_updated(2, &Pose::default());
        engine.button_event(1, ButtonEventType::Pressed, 3, 0.0);
        engine.button_event(2, ButtonEventType::Pressed, 4, 0.0);
        assert_eq!(
            host.take(),
            vec![
                HostCall::Pose(2, source_pose),
                HostCall::Button(2, ButtonEventType::Pressed, 3, 0.0),
            ]
        );

        // The runtime vibrates what it sees as device 2; device 1 is holding it.
        engine.haptic_pulse(2, 0, 50);
        engine.haptic_pulse(1, 0, 50);
        assert_eq!(host.take(), vec![HostCall::Haptic(1, 0, 50)]);
    }

    #[test]
    fn test_swap_exchanges_ids() {
        let (engine, host) = engine();
        activate(&engine, 1, DeviceClass::Controller, true);
        activate(&engine, 2, DeviceClass::Controller, true);
        engine.set_swap(1, 2).unwrap();
        engine.axis_updated(1, 0, AxisState { x: 0.5, y: 0.5 });
        engine.axis_updated(2, 1, AxisState { x: 0.1, y: 0.1 });
        engine.haptic_pulse(1, 0, 10);
        assert_eq!(
            host.take(),
            vec![
                HostCall::Axis(2, 0, AxisState { x: 0.5, y: 0.5 }),
                HostCall::Axis(1, 1, AxisState { x: 0.1, y: 0.1 }),
                HostCall::Haptic(2, 0, 10),
            ]
        );
    }

    #[test]
    fn test_button_mapping_applied() {
        let (engine, host) = engine();
        activate(&engine, 1, DeviceClass::Controller, false);
        engine
            .button_mapping(1, Toggle::Enable, 1, &[2, 7])
            .unwrap();
        engine.button_event(1, ButtonEventType::Pressed, 2, 0.0);
        engine.button_event(1, ButtonEventType::Pressed, 3, 0.0);
        assert_eq!(
            host.take(),
            vec![
                HostCall::Button(1, ButtonEventType::Pressed, 7, 0.0),
                HostCall::Button(1, ButtonEventType::Pressed, 3, 0.0),
            ]
        );
    }

    #[test]
    fn test_motion_compensation_reference_passes_through() {
        let (engine, host) = engine();
        activate(&engine, 3, DeviceClass::GenericTracker, false);
        activate(&engine, 0, DeviceClass::Hmd, false);
        engine.set_motion_compensation(3, 0).unwrap();

        let rest = Pose::default();
        engine.pose_updated(3, &rest);
        let moved = Pose {
            position: Vector3::new(0.0, 0.0, 1.0),
            ..Pose::default()
        };
        engine.pose_updated(3, &moved);
        let hmd = Pose {
            position: Vector3::new(0.0, 1.6, 1.0),
            ..Pose::default()
        };
        engine.pose_updated(0, &hmd);

        let calls = host.take();
        assert_eq!(calls[0], HostCall::Pose(3, rest));
        assert_eq!(calls[1], HostCall::Pose(3, moved));
        match &calls[2] {
            HostCall::Pose(0, out) => {
                // The reference moved +1 z; the HMD's world frame follows it back.
                assert_close(out.world_from_driver_translation, Vector3::new(0.0, 0.0, -1.0));
                assert_close(out.position, hmd.position);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_injected_pose_latency() {
        let (engine, host) = engine();
        let stamp = now_millis() - 100;
        engine.inject_pose(4, &Pose::default(), stamp);
        let (id, pose) = forwarded_pose(&host.take());
        assert_eq!(id, 4);
        assert!(pose.time_offset <= -0.1 && pose.time_offset > -5.0);
    }

    #[test]
    fn test_step_events_follow_pose() {
        let (engine, host) = engine();
        activate(&engine, 0, DeviceClass::Hmd, false);
        engine
            .step_detection(&StepDetectionRequest {
                operation: 1,
                enable: true,
                value: 0.0,
                hmd_threshold: Vector3::zeros(),
            })
            .unwrap();
        engine.pose_updated(0, &Pose::default());
        let calls = host.take();
        assert!(matches!(calls[0], HostCall::Pose(0, _)));
        assert_eq!(
            calls[1..],
            [
                HostCall::Button(0, ButtonEventType::Unpressed, AXIS0_BUTTON, 0.0),
                HostCall::Axis(0, 0, AxisState::default()),
                HostCall::Button(0, ButtonEventType::Untouched, AXIS0_BUTTON, 0.0),
            ]
        );

        // Invalid poses never reach the classifier.
        engine.pose_updated(
            0,
            &Pose {
                pose_is_valid: false,
                ..Pose::default()
            },
        );
        assert_eq!(host.take().len(), 1);
    }

    #[test]
    fn test_host_errors_are_swallowed() {
        let (engine, host) = engine();
        host.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        engine.pose_updated(1, &Pose::default());
        engine.axis_updated(1, 0, AxisState::default());
        assert_eq!(host.take().len(), 2);
    }
}
