use crate::types::{
    DeviceClass, DeviceId, DeviceInfo, DeviceMode, DeviceOffsets, OffsetFields, OffsetOperation,
    OffsetUpdate, Pose, Toggle, VelAccMode, INVALID_DEVICE_INDEX, MAX_TRACKED_DEVICES,
};
use crate::{ManipError, Result};
use nalgebra::{UnitQuaternion, Vector3};
use std::collections::HashMap;

/// Weight of the newest sample in the reference velocity moving average.
pub const VEL_ACC_AVERAGE_WEIGHT: f64 = 0.1;

/// What the host reports when a device comes up.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceActivation {
    pub id: u32,
    pub class: DeviceClass,
    pub serial: String,
    pub haptic_capable: bool,
}

/// Manipulation state of one host device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    id: DeviceId,
    class: DeviceClass,
    serial: String,
    haptic_capable: bool,
    mode: DeviceMode,
    partner: Option<DeviceId>,
    suspended: bool,
    offsets_enabled: bool,
    offsets: DeviceOffsets,
    button_mapping_enabled: bool,
    button_mapping: HashMap<u32, u32>,
    step_detection_enabled: bool,
}

impl DeviceRecord {
    fn new(id: DeviceId, activation: DeviceActivation, step_detection: bool) -> Self {
        Self {
            id,
            class: activation.class,
            serial: activation.serial,
            haptic_capable: activation.haptic_capable,
            mode: if step_detection {
                DeviceMode::StepDetection
            } else {
                DeviceMode::Normal
            },
            partner: None,
            suspended: false,
            offsets_enabled: false,
            offsets: DeviceOffsets::default(),
            button_mapping_enabled: false,
            button_mapping: HashMap::new(),
            step_detection_enabled: step_detection,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn haptic_capable(&self) -> bool {
        self.haptic_capable
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn partner(&self) -> Option<DeviceId> {
        self.partner
    }

    /// Sink side of a redirect.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn offsets_enabled(&self) -> bool {
        self.offsets_enabled
    }

    pub fn offsets(&self) -> &DeviceOffsets {
        &self.offsets
    }

    pub fn button_mapping_enabled(&self) -> bool {
        self.button_mapping_enabled
    }

    /// Apply the button mapping table when enabled.
    pub fn map_button(&self, button: u32) -> u32 {
        if self.button_mapping_enabled {
            self.button_mapping.get(&button).copied().unwrap_or(button)
        } else {
            button
        }
    }

    pub fn step_detection_enabled(&self) -> bool {
        self.step_detection_enabled
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.id.raw(),
            device_class: self.class,
            mode: self.mode,
            offsets_enabled: self.offsets_enabled,
            button_mapping_enabled: self.button_mapping_enabled,
            redirect_suspended: self.suspended,
            step_detection_enabled: self.step_detection_enabled,
            partner_id: self.partner.map_or(INVALID_DEVICE_INDEX, DeviceId::raw),
        }
    }

    fn unpair(&mut self) -> Option<DeviceId> {
        self.suspended = false;
        self.partner.take()
    }
}

/// Combine `update` into `offsets`. Only the flagged fields change.
pub fn compose_offsets(offsets: &mut DeviceOffsets, op: OffsetOperation, update: &OffsetUpdate) {
    let f = update.fields;
    let v = &update.values;
    match op {
        OffsetOperation::Set => {
            if f.contains(OffsetFields::WORLD_FROM_DRIVER_ROTATION) {
                offsets.world_from_driver_rotation = v.world_from_driver_rotation;
            }
            if f.contains(OffsetFields::WORLD_FROM_DRIVER_TRANSLATION) {
                offsets.world_from_driver_translation = v.world_from_driver_translation;
            }
            if f.contains(OffsetFields::DRIVER_FROM_HEAD_ROTATION) {
                offsets.driver_from_head_rotation = v.driver_from_head_rotation;
            }
            if f.contains(OffsetFields::DRIVER_FROM_HEAD_TRANSLATION) {
                offsets.driver_from_head_translation = v.driver_from_head_translation;
            }
            if f.contains(OffsetFields::DEVICE_ROTATION) {
                offsets.device_rotation = v.device_rotation;
            }
            if f.contains(OffsetFields::DEVICE_TRANSLATION) {
                offsets.device_translation = v.device_translation;
            }
        }
        OffsetOperation::Merge => {
            if f.contains(OffsetFields::WORLD_FROM_DRIVER_ROTATION) {
                offsets.world_from_driver_rotation =
                    v.world_from_driver_rotation * offsets.world_from_driver_rotation;
            }
            if f.contains(OffsetFields::WORLD_FROM_DRIVER_TRANSLATION) {
                offsets.world_from_driver_translation += v.world_from_driver_translation;
            }
            if f.contains(OffsetFields::DRIVER_FROM_HEAD_ROTATION) {
                offsets.driver_from_head_rotation =
                    v.driver_from_head_rotation * offsets.driver_from_head_rotation;
            }
            if f.contains(OffsetFields::DRIVER_FROM_HEAD_TRANSLATION) {
                offsets.driver_from_head_translation += v.driver_from_head_translation;
            }
            if f.contains(OffsetFields::DEVICE_ROTATION) {
                offsets.device_rotation = v.device_rotation * offsets.device_rotation;
            }
            if f.contains(OffsetFields::DEVICE_TRANSLATION) {
                offsets.device_translation += v.device_translation;
            }
        }
    }
}

/// World-space pose of the compensation reference.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ReferenceSample {
    rotation: UnitQuaternion<f64>,
    position: Vector3<f64>,
}

/// Process-wide motion-compensation state.
#[derive(Debug, Clone, Default)]
pub struct MotionCompensation {
    reference: Option<DeviceId>,
    vel_acc_mode: VelAccMode,
    rest: Option<ReferenceSample>,
    current: Option<ReferenceSample>,
    velocity: Vector3<f64>,
    acceleration: Vector3<f64>,
    velocity_average: Vector3<f64>,
    acceleration_average: Vector3<f64>,
}

impl MotionCompensation {
    pub fn reference(&self) -> Option<DeviceId> {
        self.reference
    }

    pub fn vel_acc_mode(&self) -> VelAccMode {
        self.vel_acc_mode
    }

    fn start(&mut self, id: DeviceId) {
        *self = MotionCompensation {
            reference: Some(id),
            vel_acc_mode: self.vel_acc_mode,
            ..MotionCompensation::default()
        };
    }

    fn stop(&mut self) {
        *self = MotionCompensation {
            vel_acc_mode: self.vel_acc_mode,
            ..MotionCompensation::default()
        };
    }

    /// Record a pose of the reference device. The first valid sample after
    /// entering the mode becomes the rest pose.
    pub fn capture(&mut self, pose: &Pose) {
        if !pose.pose_is_valid {
            return;
        }
        let world_from_driver = UnitQuaternion::from_quaternion(pose.world_from_driver_rotation);
        let sample = ReferenceSample {
            rotation: world_from_driver * UnitQuaternion::from_quaternion(pose.rotation),
            position: world_from_driver * pose.position + pose.world_from_driver_translation,
        };
        if self.rest.is_none() {
            self.rest = Some(sample);
            self.velocity_average = pose.velocity;
            self.acceleration_average = pose.acceleration;
        }
        self.current = Some(sample);
        self.velocity = pose.velocity;
        self.acceleration = pose.acceleration;
        self.velocity_average += (pose.velocity - self.velocity_average) * VEL_ACC_AVERAGE_WEIGHT;
        self.acceleration_average +=
            (pose.acceleration - self.acceleration_average) * VEL_ACC_AVERAGE_WEIGHT;
    }

    /// Transform to apply to other devices, once the reference has reported.
    pub fn frame(&self) -> Option<CompensationFrame> {
        let rest = self.rest?;
        let current = self.current?;
        let (velocity, acceleration) = match self.vel_acc_mode {
            VelAccMode::Disabled => (Vector3::zeros(), Vector3::zeros()),
            VelAccMode::ReferenceOnly => (self.velocity, self.acceleration),
            VelAccMode::Blended => (
                (self.velocity + self.velocity_average) * 0.5,
                (self.acceleration + self.acceleration_average) * 0.5,
            ),
        };
        Some(CompensationFrame {
            delta_inverse: rest.rotation * current.rotation.inverse(),
            current_position: current.position,
            rest_position: rest.position,
            velocity,
            acceleration,
        })
    }
}

/// Snapshot of the reference motion, copied out of the registry lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompensationFrame {
    /// Inverse of the reference rotation since rest.
    pub delta_inverse: UnitQuaternion<f64>,
    pub current_position: Vector3<f64>,
    pub rest_position: Vector3<f64>,
    /// Velocity to subtract, zero when velocity compensation is off.
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
}

impl CompensationFrame {
    /// Move `pose` into the reference's rest frame through its world-from-driver transform.
    pub fn apply(&self, pose: &mut Pose) {
        pose.world_from_driver_rotation =
            self.delta_inverse.into_inner() * pose.world_from_driver_rotation;
        pose.world_from_driver_translation = self.delta_inverse
            * (pose.world_from_driver_translation - self.current_position)
            + self.rest_position;
        pose.velocity -= self.velocity;
        pose.acceleration -= self.acceleration;
    }
}

/// Device records indexed by host id, plus the process-wide manipulation state.
pub struct DeviceRegistry {
    records: Vec<Option<DeviceRecord>>,
    motion: MotionCompensation,
    step_detection_enabled: bool,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            records: (0..MAX_TRACKED_DEVICES).map(|_| None).collect(),
            motion: MotionCompensation::default(),
            step_detection_enabled: false,
        }
    }

    /// Create the record for a newly activated device, replacing a stale one.
    pub fn activate(&mut self, activation: DeviceActivation) -> Result<DeviceId> {
        let id = DeviceId::new(activation.id)?;
        if self.records[id.index()].is_some() {
            self.deactivate(id);
        }
        log::info!(
            "Device {} activated ({:?}, serial \"{}\")",
            id,
            activation.class,
            activation.serial
        );
        self.records[id.index()] = Some(DeviceRecord::new(
            id,
            activation,
            self.step_detection_enabled,
        ));
        Ok(id)
    }

    /// Drop a record, dissolving its pairing and any compensation reference.
    pub fn deactivate(&mut self, id: DeviceId) -> Option<DeviceRecord> {
        self.dissolve_pairing(id);
        self.drop_reference(id);
        let record = self.records[id.index()].take();
        if record.is_some() {
            log::info!("Device {} deactivated", id);
        }
        record
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceRecord> {
        self.records[id.index()].as_ref()
    }

    /// Resolve a raw id, failing with `InvalidId` or `NotFound`.
    pub fn lookup(&self, raw: u32) -> Result<&DeviceRecord> {
        let id = DeviceId::new(raw)?;
        self.get(id).ok_or(ManipError::NotFound(raw))
    }

    fn lookup_mut(&mut self, raw: u32) -> Result<&mut DeviceRecord> {
        let id = DeviceId::new(raw)?;
        self.records[id.index()]
            .as_mut()
            .ok_or(ManipError::NotFound(raw))
    }

    /// Resolve without error reporting; unknown ids are left alone by the pipeline.
    pub fn find(&self, raw: u32) -> Option<&DeviceRecord> {
        DeviceId::new(raw).ok().and_then(|id| self.get(id))
    }

    pub fn active_ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.records.iter().flatten().map(DeviceRecord::id)
    }

    pub fn info(&self, raw: u32) -> Result<DeviceInfo> {
        self.lookup(raw).map(DeviceRecord::info)
    }

    pub fn offsets(&self, raw: u32) -> Result<(bool, DeviceOffsets)> {
        let record = self.lookup(raw)?;
        Ok((record.offsets_enabled, record.offsets))
    }

    /// Set or merge offsets. The operation is validated before anything changes.
    pub fn set_offsets(
        &mut self,
        raw: u32,
        operation: u32,
        enable: Toggle,
        update: &OffsetUpdate,
    ) -> Result<()> {
        let record = self.lookup_mut(raw)?;
        let op = OffsetOperation::from_raw(operation)?;
        enable.apply(&mut record.offsets_enabled);
        compose_offsets(&mut record.offsets, op, update);
        Ok(())
    }

    /// Edit the button mapping table.
    ///
    /// Operations: 0 none, 1 add `source, target` pairs, 2 erase the listed
    /// sources, 3 erase everything.
    pub fn apply_button_mapping(
        &mut self,
        raw: u32,
        enable: Toggle,
        operation: u32,
        values: &[u32],
    ) -> Result<()> {
        let record = self.lookup_mut(raw)?;
        if operation > 3 {
            return Err(ManipError::InvalidOperation(operation));
        }
        enable.apply(&mut record.button_mapping_enabled);
        match operation {
            1 => {
                for pair in values.chunks_exact(2) {
                    record.button_mapping.insert(pair[0], pair[1]);
                }
            }
            2 => {
                for source in values {
                    record.button_mapping.remove(source);
                }
            }
            3 => record.button_mapping.clear(),
            _ => {}
        }
        Ok(())
    }

    pub fn set_default_mode(&mut self, raw: u32) -> Result<()> {
        let id = self.lookup(raw)?.id;
        self.dissolve_pairing(id);
        self.drop_reference(id);
        self.set_mode(id, DeviceMode::Normal);
        Ok(())
    }

    pub fn set_fake_disconnected(&mut self, raw: u32) -> Result<()> {
        let id = self.lookup(raw)?.id;
        self.dissolve_pairing(id);
        self.drop_reference(id);
        self.set_mode(id, DeviceMode::Disabled);
        Ok(())
    }

    /// Redirect `raw` (source) onto `target_raw` (sink).
    pub fn set_redirect(&mut self, raw: u32, target_raw: u32) -> Result<()> {
        let (source, target) = self.check_pairing(raw, target_raw)?;
        self.pair(source, target, DeviceMode::Redirect);
        if let Some(sink) = self.records[target.index()].as_mut() {
            sink.suspended = true;
        }
        log::info!("Device {} redirected to {}", source, target);
        Ok(())
    }

    pub fn set_swap(&mut self, raw: u32, target_raw: u32) -> Result<()> {
        let (a, b) = self.check_pairing(raw, target_raw)?;
        self.pair(a, b, DeviceMode::Swap);
        log::info!("Devices {} and {} swapped", a, b);
        Ok(())
    }

    /// Make `raw` the compensation reference.
    pub fn set_motion_compensation(&mut self, raw: u32, vel_acc_mode: u32) -> Result<()> {
        let id = self.lookup(raw)?.id;
        let mode = VelAccMode::try_from(vel_acc_mode)?;
        self.dissolve_pairing(id);
        if let Some(previous) = self.motion.reference.filter(|&prev| prev != id) {
            self.set_mode(previous, DeviceMode::Normal);
        }
        self.motion.vel_acc_mode = mode;
        self.motion.start(id);
        self.set_mode(id, DeviceMode::MotionCompensation);
        log::info!(
            "Device {} is the motion compensation reference ({:?})",
            id,
            mode
        );
        Ok(())
    }

    pub fn set_vel_acc_mode(&mut self, raw_mode: u32) -> Result<()> {
        self.motion.vel_acc_mode = VelAccMode::try_from(raw_mode)?;
        Ok(())
    }

    pub fn vel_acc_mode(&self) -> VelAccMode {
        self.motion.vel_acc_mode
    }

    pub fn motion(&self) -> &MotionCompensation {
        &self.motion
    }

    pub fn motion_mut(&mut self) -> &mut MotionCompensation {
        &mut self.motion
    }

    pub fn step_detection_enabled(&self) -> bool {
        self.step_detection_enabled
    }

    /// Global step-detection switch. Enabling moves Normal devices into
    /// StepDetection; disabling moves them back.
    pub fn set_step_detection_enabled(&mut self, enable: bool) {
        self.step_detection_enabled = enable;
        let ids: Vec<DeviceId> = self.active_ids().collect();
        for id in ids {
            if enable {
                if self.get(id).map(DeviceRecord::mode) == Some(DeviceMode::Normal) {
                    self.enter_step_detection(id);
                } else if let Some(record) = self.records[id.index()].as_mut() {
                    record.step_detection_enabled = true;
                }
            } else if let Some(record) = self.records[id.index()].as_mut() {
                record.step_detection_enabled = false;
                if record.mode == DeviceMode::StepDetection {
                    record.mode = DeviceMode::Normal;
                }
            }
        }
    }

    fn enter_step_detection(&mut self, id: DeviceId) {
        self.dissolve_pairing(id);
        if let Some(record) = self.records[id.index()].as_mut() {
            record.mode = DeviceMode::StepDetection;
            record.step_detection_enabled = true;
        }
    }

    /// Hardware that should vibrate for a haptic request addressed to `raw`.
    ///
    /// `None` means the pulse is dropped. Unknown ids pass through untouched.
    pub fn haptic_target(&self, raw: u32) -> Option<u32> {
        let Some(record) = self.find(raw) else {
            return Some(raw);
        };
        match (record.mode, record.partner) {
            (DeviceMode::Disabled, _) => None,
            (DeviceMode::Redirect, Some(partner)) if record.suspended => Some(partner.raw()),
            (DeviceMode::Redirect, _) => None,
            (DeviceMode::Swap, Some(partner)) => Some(partner.raw()),
            _ => Some(raw),
        }
    }

    fn check_pairing(&self, raw: u32, target_raw: u32) -> Result<(DeviceId, DeviceId)> {
        let source = self.lookup(raw)?;
        let target_id = DeviceId::new(target_raw)?;
        let Some(target) = self.get(target_id) else {
            return Err(ManipError::PairingRejected("target device is not active"));
        };
        if source.id == target_id {
            return Err(ManipError::PairingRejected("a device cannot pair with itself"));
        }
        if !source.mode.is_pairable() || !target.mode.is_pairable() {
            return Err(ManipError::PairingRejected(
                "both devices must be in normal or disabled mode",
            ));
        }
        Ok((source.id, target.id))
    }

    fn pair(&mut self, a: DeviceId, b: DeviceId, mode: DeviceMode) {
        for (this, other) in [(a, b), (b, a)] {
            if let Some(record) = self.records[this.index()].as_mut() {
                record.mode = mode;
                record.partner = Some(other);
                record.suspended = false;
            }
        }
    }

    /// Break the pairing of `id` on both sides. The partner returns to Normal.
    fn dissolve_pairing(&mut self, id: DeviceId) {
        let Some(partner) = self.records[id.index()]
            .as_mut()
            .and_then(DeviceRecord::unpair)
        else {
            return;
        };
        if let Some(record) = self.records[partner.index()].as_mut() {
            record.unpair();
            if matches!(record.mode, DeviceMode::Redirect | DeviceMode::Swap) {
                record.mode = DeviceMode::Normal;
            }
        }
        log::debug!("Pairing {} <-> {} dissolved", id, partner);
    }

    fn drop_reference(&mut self, id: DeviceId) {
        if self.motion.reference == Some(id) {
            self.motion.stop();
            log::debug!("Device {} no longer the compensation reference", id);
        }
    }

    fn set_mode(&mut self, id: DeviceId, mode: DeviceMode) {
        if let Some(record) = self.records[id.index()].as_mut() {
            record.mode = mode;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::rotation_from_yaw_pitch_roll_deg;
    use nalgebra::Quaternion;
    use proptest::prelude::*;

    fn registry_with(ids: &[u32]) -> DeviceRegistry {
        let mut reg = DeviceRegistry::new();
        for &id in ids {
            reg.activate(DeviceActivation {
                id,
                class: if id == 0 {
                    DeviceClass::Hmd
                } else {
                    DeviceClass::Controller
                },
                serial: format!("dev-{}", id),
                haptic_capable: id != 0,
            })
            .unwrap();
        }
        reg
    }

    fn partner_of(reg: &DeviceRegistry, raw: u32) -> Option<u32> {
        reg.lookup(raw).unwrap().partner().map(DeviceId::raw)
    }

    #[test]
    fn test_lookup_errors() {
        let reg = registry_with(&[1]);
        assert_eq!(reg.info(64).unwrap_err(), ManipError::InvalidId(64));
        assert_eq!(reg.info(2).unwrap_err(), ManipError::NotFound(2));
        assert_eq!(reg.info(1).unwrap().mode, DeviceMode::Normal);
    }

    #[test]
    fn test_redirect_pairs_symmetrically() {
        let mut reg = registry_with(&[1, 2]);
        reg.set_redirect(1, 2).unwrap();

        let a = reg.lookup(1).unwrap();
        let b = reg.lookup(2).unwrap();
        assert_eq!(a.mode(), DeviceMode::Redirect);
        assert!(!a.is_suspended());
        assert_eq!(b.mode(), DeviceMode::Redirect);
        assert!(b.is_suspended());
        assert_eq!(partner_of(&reg, 1), Some(2));
        assert_eq!(partner_of(&reg, 2), Some(1));
    }

    #[test]
    fn test_default_mode_clears_both_sides() {
        let mut reg = registry_with(&[1, 2]);
        reg.set_swap(1, 2).unwrap();
        reg.set_default_mode(2).unwrap();
        for raw in [1, 2] {
            let record = reg.lookup(raw).unwrap();
            assert_eq!(record.partner(), None);
            assert_eq!(record.mode(), DeviceMode::Normal);
            assert!(!record.is_suspended());
        }
    }

    #[test]
    fn test_pairing_preconditions_leave_state_untouched() {
        let mut reg = registry_with(&[1, 2, 3]);
        reg.set_swap(1, 2).unwrap();

        assert!(matches!(
            reg.set_redirect(3, 1),
            Err(ManipError::PairingRejected(_))
        ));
        assert!(matches!(
            reg.set_redirect(3, 3),
            Err(ManipError::PairingRejected(_))
        ));
        assert!(matches!(
            reg.set_redirect(3, 9),
            Err(ManipError::PairingRejected(_))
        ));
        assert_eq!(reg.set_redirect(3, 100), Err(ManipError::InvalidId(100)));
        assert_eq!(reg.set_redirect(5, 1), Err(ManipError::NotFound(5)));

        assert_eq!(reg.lookup(3).unwrap().mode(), DeviceMode::Normal);
        assert_eq!(partner_of(&reg, 1), Some(2));
        assert_eq!(partner_of(&reg, 2), Some(1));
    }

    #[test]
    fn test_pairing_rejected_maps_to_unknown_error() {
        let mut reg = registry_with(&[1]);
        let err = reg.set_swap(1, 1).unwrap_err();
        assert_eq!(err.status(), crate::protocol::Status::UnknownError);
    }

    #[test]
    fn test_disabled_devices_can_pair() {
        let mut reg = registry_with(&[1, 2]);
        reg.set_fake_disconnected(2).unwrap();
        reg.set_redirect(1, 2).unwrap();
        assert_eq!(reg.lookup(2).unwrap().mode(), DeviceMode::Redirect);
    }

    #[test]
    fn test_fake_disconnect_dissolves_pairing() {
        let mut reg = registry_with(&[1, 2]);
        reg.set_redirect(1, 2).unwrap();
        reg.set_fake_disconnected(1).unwrap();
        assert_eq!(reg.lookup(1).unwrap().mode(), DeviceMode::Disabled);
        assert_eq!(reg.lookup(2).unwrap().mode(), DeviceMode::Normal);
        assert_eq!(partner_of(&reg, 2), None);
    }

    #[test]
    fn test_deactivate_releases_partner_and_reference() {
        let mut reg = registry_with(&[1, 2, 3]);
        reg.set_swap(1, 2).unwrap();
        reg.set_motion_compensation(3, 1).unwrap();
        reg.deactivate(DeviceId::new(1).unwrap());
        reg.deactivate(DeviceId::new(3).unwrap());
        assert_eq!(reg.lookup(2).unwrap().mode(), DeviceMode::Normal);
        assert_eq!(partner_of(&reg, 2), None);
        assert_eq!(reg.motion().reference(), None);
    }

    #[test]
    fn test_motion_compensation_single_reference() {
        let mut reg = registry_with(&[1, 2]);
        reg.set_motion_compensation(1, 0).unwrap();
        reg.set_motion_compensation(2, 2).unwrap();
        assert_eq!(reg.lookup(1).unwrap().mode(), DeviceMode::Normal);
        assert_eq!(reg.lookup(2).unwrap().mode(), DeviceMode::MotionCompensation);
        assert_eq!(reg.motion().reference(), DeviceId::new(2).ok());
        assert_eq!(reg.vel_acc_mode(), VelAccMode::Blended);
    }

    #[test]
    fn test_motion_compensation_rejects_unknown_vel_acc_mode() {
        let mut reg = registry_with(&[1]);
        assert_eq!(
            reg.set_motion_compensation(1, 3),
            Err(ManipError::InvalidOperation(3))
        );
        assert_eq!(reg.lookup(1).unwrap().mode(), DeviceMode::Normal);
        assert_eq!(reg.motion().reference(), None);
    }

    #[test]
    fn test_set_get_offsets_exact() {
        let mut reg = registry_with(&[4]);
        let values = DeviceOffsets {
            world_from_driver_rotation: Quaternion::new(0.7, 0.1, -0.2, 0.3),
            world_from_driver_translation: Vector3::new(0.25, -1.5, 3.125),
            driver_from_head_rotation: rotation_from_yaw_pitch_roll_deg(12.0, -3.0, 45.0),
            driver_from_head_translation: Vector3::new(1e-9, 2.0, -0.1),
            device_rotation: Quaternion::new(0.0, 1.0, 0.0, 0.0),
            device_translation: Vector3::new(0.0, 0.0, 0.05),
        };
        reg.set_offsets(4, 0, Toggle::Enable, &OffsetUpdate::all(values))
            .unwrap();
        assert_eq!(reg.offsets(4).unwrap(), (true, values));
    }

    #[test]
    fn test_partial_set_and_disable_keeps_values() {
        let mut reg = registry_with(&[4]);
        let mut values = DeviceOffsets::default();
        values.device_translation = Vector3::new(1.0, 2.0, 3.0);
        values.world_from_driver_translation = Vector3::new(9.0, 9.0, 9.0);
        let update = OffsetUpdate {
            fields: OffsetFields::DEVICE_TRANSLATION,
            values,
        };
        reg.set_offsets(4, 0, Toggle::Enable, &update).unwrap();
        reg.set_offsets(4, 0, Toggle::Disable, &OffsetUpdate {
            fields: OffsetFields::empty(),
            values,
        })
        .unwrap();

        let (enabled, stored) = reg.offsets(4).unwrap();
        assert!(!enabled);
        assert_eq!(stored.device_translation, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(stored.world_from_driver_translation, Vector3::zeros());
    }

    #[test]
    fn test_invalid_offset_operation_is_checked_first() {
        let mut reg = registry_with(&[4]);
        let update = OffsetUpdate::all(DeviceOffsets {
            device_translation: Vector3::new(1.0, 0.0, 0.0),
            ..DeviceOffsets::default()
        });
        assert_eq!(
            reg.set_offsets(4, 7, Toggle::Enable, &update),
            Err(ManipError::InvalidOperation(7))
        );
        assert_eq!(reg.offsets(4).unwrap(), (false, DeviceOffsets::default()));
    }

    #[test]
    fn test_button_mapping_operations() {
        let mut reg = registry_with(&[1]);
        reg.apply_button_mapping(1, Toggle::Enable, 1, &[2, 33, 7, 1])
            .unwrap();
        let record = reg.lookup(1).unwrap();
        assert_eq!(record.map_button(2), 33);
        assert_eq!(record.map_button(7), 1);
        assert_eq!(record.map_button(5), 5);

        reg.apply_button_mapping(1, Toggle::Unchanged, 2, &[2]).unwrap();
        assert_eq!(reg.lookup(1).unwrap().map_button(2), 2);
        assert_eq!(reg.lookup(1).unwrap().map_button(7), 1);

        reg.apply_button_mapping(1, Toggle::Disable, 0, &[]).unwrap();
        assert_eq!(reg.lookup(1).unwrap().map_button(7), 7);

        reg.apply_button_mapping(1, Toggle::Enable, 3, &[]).unwrap();
        assert_eq!(reg.lookup(1).unwrap().map_button(7), 7);

        assert_eq!(
            reg.apply_button_mapping(1, Toggle::Disable, 4, &[]),
            Err(ManipError::InvalidOperation(4))
        );
        assert!(reg.lookup(1).unwrap().button_mapping_enabled());
    }

    #[test]
    fn test_haptic_routing() {
        let mut reg = registry_with(&[1, 2, 3, 4, 5]);
        reg.set_redirect(1, 2).unwrap();
        reg.set_swap(3, 4).unwrap();
        reg.set_fake_disconnected(5).unwrap();

        assert_eq!(reg.haptic_target(2), Some(1));
        assert_eq!(reg.haptic_target(1), None);
        assert_eq!(reg.haptic_target(3), Some(4));
        assert_eq!(reg.haptic_target(4), Some(3));
        assert_eq!(reg.haptic_target(5), None);
        assert_eq!(reg.haptic_target(9), Some(9));
    }

    #[test]
    fn test_global_step_detection_toggle() {
        let mut reg = registry_with(&[0, 1, 2]);
        reg.set_fake_disconnected(2).unwrap();
        reg.set_step_detection_enabled(true);
        assert_eq!(reg.lookup(0).unwrap().mode(), DeviceMode::StepDetection);
        assert!(reg.lookup(1).unwrap().step_detection_enabled());
        assert_eq!(reg.lookup(2).unwrap().mode(), DeviceMode::Disabled);
        assert!(reg.lookup(2).unwrap().step_detection_enabled());

        reg.set_step_detection_enabled(false);
        assert_eq!(reg.lookup(0).unwrap().mode(), DeviceMode::Normal);
        assert!(!reg.lookup(1).unwrap().step_detection_enabled());
        assert_eq!(reg.lookup(2).unwrap().mode(), DeviceMode::Disabled);
    }

    #[test]
    fn test_compensation_frame_cancels_reference_motion() {
        let mut motion = MotionCompensation::default();
        motion.start(DeviceId::new(1).unwrap());

        let rest = Pose {
            position: Vector3::new(0.0, 1.0, 0.0),
            ..Pose::default()
        };
        motion.capture(&rest);
        let moved = Pose {
            position: Vector3::new(0.5, 1.0, 0.0),
            rotation: rotation_from_yaw_pitch_roll_deg(90.0, 0.0, 0.0),
            ..Pose::default()
        };
        motion.capture(&moved);

        // A device rigidly attached to the reference ends up where it was at rest.
        let frame = motion.frame().unwrap();
        let mut attached = Pose {
            position: Vector3::new(0.5, 1.0, -1.0),
            ..Pose::default()
        };
        frame.apply(&mut attached);
        let wfd = UnitQuaternion::from_quaternion(attached.world_from_driver_rotation);
        let world = wfd * attached.position + attached.world_from_driver_translation;
        let expected = Vector3::new(1.0, 1.0, 0.0);
        assert!((world - expected).norm() < 1e-9, "got {:?}", world);
    }

    #[test]
    fn test_velocity_compensation_modes() {
        let mut motion = MotionCompensation::default();
        motion.start(DeviceId::new(1).unwrap());
        let sample = Pose {
            velocity: Vector3::new(1.0, 0.0, 0.0),
            ..Pose::default()
        };
        motion.capture(&sample);

        assert_eq!(motion.frame().unwrap().velocity, Vector3::zeros());
        motion.vel_acc_mode = VelAccMode::ReferenceOnly;
        assert_eq!(motion.frame().unwrap().velocity, Vector3::new(1.0, 0.0, 0.0));
        motion.vel_acc_mode = VelAccMode::Blended;
        assert_eq!(motion.frame().unwrap().velocity, Vector3::new(1.0, 0.0, 0.0));
    }

    fn arb_quaternion() -> impl Strategy<Value = Quaternion<f64>> {
        (-1.0f64..1.0, -1.0f64..1.0, -1.0f64..1.0, -1.0f64..1.0)
            .prop_map(|(w, i, j, k)| Quaternion::new(w, i, j, k))
    }

    fn arb_vector() -> impl Strategy<Value = Vector3<f64>> {
        (-10.0f64..10.0, -10.0f64..10.0, -10.0f64..10.0).prop_map(|(x, y, z)| Vector3::new(x, y, z))
    }

    fn rotation_update(q: Quaternion<f64>, t: Vector3<f64>) -> OffsetUpdate {
        OffsetUpdate {
            fields: OffsetFields::WORLD_FROM_DRIVER_ROTATION
                | OffsetFields::WORLD_FROM_DRIVER_TRANSLATION,
            values: DeviceOffsets {
                world_from_driver_rotation: q,
                world_from_driver_translation: t,
                ..DeviceOffsets::default()
            },
        }
    }

    proptest! {
        #[test]
        fn prop_merge_composes_in_order(
            qa in arb_quaternion(), ta in arb_vector(),
            qb in arb_quaternion(), tb in arb_vector(),
        ) {
            let mut stepwise = DeviceOffsets::default();
            compose_offsets(&mut stepwise, OffsetOperation::Merge, &rotation_update(qa, ta));
            compose_offsets(&mut stepwise, OffsetOperation::Merge, &rotation_update(qb, tb));

            let mut single = DeviceOffsets::default();
            compose_offsets(&mut single, OffsetOperation::Merge, &rotation_update(qb * qa, ta + tb));

            let dq = stepwise.world_from_driver_rotation.coords - single.world_from_driver_rotation.coords;
            prop_assert!(dq.norm() < 1e-9);
            let dt = stepwise.world_from_driver_translation - single.world_from_driver_translation;
            prop_assert!(dt.norm() < 1e-9);
        }
    }
}
