use crate::{ManipError, Result};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Number of device slots the host can hand out.
pub const MAX_TRACKED_DEVICES: u32 = 64;

/// Host device index meaning "no device".
pub const INVALID_DEVICE_INDEX: u32 = u32::MAX;

/// Button id of the synthetic axis-0 button used by step detection.
pub const AXIS0_BUTTON: u32 = 32;

/// Number of analog axes a controller reports.
pub const CONTROLLER_AXIS_COUNT: usize = 5;

/// Bounds-checked host device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    pub fn new(raw: u32) -> Result<DeviceId> {
        if raw < MAX_TRACKED_DEVICES {
            Ok(DeviceId(raw))
        } else {
            Err(ManipError::InvalidId(raw))
        }
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Class of a tracked device as reported by the host.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Invalid = 0,
    Hmd = 1,
    Controller = 2,
    GenericTracker = 3,
    TrackingReference = 4,
    DisplayRedirect = 5,
}

impl DeviceClass {
    pub fn from_raw(raw: u32) -> DeviceClass {
        match raw {
            1 => DeviceClass::Hmd,
            2 => DeviceClass::Controller,
            3 => DeviceClass::GenericTracker,
            4 => DeviceClass::TrackingReference,
            5 => DeviceClass::DisplayRedirect,
            _ => DeviceClass::Invalid,
        }
    }
}

/// Manipulation mode of a device record.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceMode {
    #[default]
    Normal = 0,
    Disabled = 1,
    Redirect = 2,
    Swap = 3,
    MotionCompensation = 4,
    StepDetection = 5,
}

impl DeviceMode {
    pub fn from_raw(raw: u32) -> Option<DeviceMode> {
        match raw {
            0 => Some(DeviceMode::Normal),
            1 => Some(DeviceMode::Disabled),
            2 => Some(DeviceMode::Redirect),
            3 => Some(DeviceMode::Swap),
            4 => Some(DeviceMode::MotionCompensation),
            5 => Some(DeviceMode::StepDetection),
            _ => None,
        }
    }

    /// Modes a device may be paired from.
    pub fn is_pairable(self) -> bool {
        matches!(self, DeviceMode::Normal | DeviceMode::Disabled)
    }
}

/// Kind of a discrete button event.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEventType {
    Pressed = 0,
    Unpressed = 1,
    Touched = 2,
    Untouched = 3,
}

impl ButtonEventType {
    pub fn from_raw(raw: u32) -> Option<ButtonEventType> {
        match raw {
            0 => Some(ButtonEventType::Pressed),
            1 => Some(ButtonEventType::Unpressed),
            2 => Some(ButtonEventType::Touched),
            3 => Some(ButtonEventType::Untouched),
            _ => None,
        }
    }
}

/// How velocity and acceleration of compensated devices are treated.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum VelAccMode {
    /// Velocity and acceleration pass through untouched.
    #[default]
    Disabled = 0,
    /// Subtract the reference device's velocity and acceleration.
    ReferenceOnly = 1,
    /// Subtract a blend of the reference value and its moving average.
    Blended = 2,
}

impl TryFrom<u32> for VelAccMode {
    type Error = ManipError;

    fn try_from(raw: u32) -> Result<VelAccMode> {
        match raw {
            0 => Ok(VelAccMode::Disabled),
            1 => Ok(VelAccMode::ReferenceOnly),
            2 => Ok(VelAccMode::Blended),
            other => Err(ManipError::InvalidOperation(other)),
        }
    }
}

impl From<VelAccMode> for u32 {
    fn from(mode: VelAccMode) -> u32 {
        mode as u32
    }
}

/// State of one analog axis.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisState {
    pub x: f32,
    pub y: f32,
}

/// A discrete button event on a host device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ButtonEvent {
    pub device_id: u32,
    pub kind: ButtonEventType,
    pub button: u32,
    pub time_offset: f64,
}

/// An analog axis update on a host device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisEvent {
    pub device_id: u32,
    pub axis: u32,
    pub state: AxisState,
}

/// Full pose sample of a tracked device.
///
/// Rotations are stored as raw quaternions so that values submitted by a
/// client come back bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Seconds between the sample and "now"; negative means the sample is old.
    pub time_offset: f64,
    pub world_from_driver_rotation: Quaternion<f64>,
    pub world_from_driver_translation: Vector3<f64>,
    pub driver_from_head_rotation: Quaternion<f64>,
    pub driver_from_head_translation: Vector3<f64>,
    /// Position in driver space, meters.
    pub position: Vector3<f64>,
    pub rotation: Quaternion<f64>,
    /// Linear velocity in driver space, m/s.
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    pub angular_acceleration: Vector3<f64>,
    pub pose_is_valid: bool,
    pub device_is_connected: bool,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            time_offset: 0.0,
            world_from_driver_rotation: Quaternion::identity(),
            world_from_driver_translation: Vector3::zeros(),
            driver_from_head_rotation: Quaternion::identity(),
            driver_from_head_translation: Vector3::zeros(),
            position: Vector3::zeros(),
            rotation: Quaternion::identity(),
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            angular_acceleration: Vector3::zeros(),
            pose_is_valid: true,
            device_is_connected: true,
        }
    }
}

/// Button and axis state of a (virtual) controller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControllerState {
    pub packet_num: u32,
    /// Bit `n` set means button id `n` is pressed.
    pub buttons_pressed: u64,
    pub buttons_touched: u64,
    pub axes: [AxisState; CONTROLLER_AXIS_COUNT],
}

bitflags::bitflags! {
    /// Which offset fields a request carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct OffsetFields: u32 {
        const WORLD_FROM_DRIVER_ROTATION    = 1 << 0;
        const WORLD_FROM_DRIVER_TRANSLATION = 1 << 1;
        const DRIVER_FROM_HEAD_ROTATION     = 1 << 2;
        const DRIVER_FROM_HEAD_TRANSLATION  = 1 << 3;
        const DEVICE_ROTATION               = 1 << 4;
        const DEVICE_TRANSLATION            = 1 << 5;
    }
}

/// The six geometric offsets of a device record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceOffsets {
    pub world_from_driver_rotation: Quaternion<f64>,
    pub world_from_driver_translation: Vector3<f64>,
    pub driver_from_head_rotation: Quaternion<f64>,
    pub driver_from_head_translation: Vector3<f64>,
    pub device_rotation: Quaternion<f64>,
    pub device_translation: Vector3<f64>,
}

impl Default for DeviceOffsets {
    fn default() -> Self {
        Self {
            world_from_driver_rotation: Quaternion::identity(),
            world_from_driver_translation: Vector3::zeros(),
            driver_from_head_rotation: Quaternion::identity(),
            driver_from_head_translation: Vector3::zeros(),
            device_rotation: Quaternion::identity(),
            device_translation: Vector3::zeros(),
        }
    }
}

/// How supplied offsets combine with the stored ones.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetOperation {
    /// Overwrite verbatim.
    Set = 0,
    /// Rotations pre-multiply (`supplied * current`), translations add.
    Merge = 1,
}

impl OffsetOperation {
    pub fn from_raw(raw: u32) -> Result<OffsetOperation> {
        match raw {
            0 => Ok(OffsetOperation::Set),
            1 => Ok(OffsetOperation::Merge),
            other => Err(ManipError::InvalidOperation(other)),
        }
    }
}

/// Partial offset update: only the fields flagged in `fields` are read from `values`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetUpdate {
    pub fields: OffsetFields,
    pub values: DeviceOffsets,
}

impl OffsetUpdate {
    pub fn all(values: DeviceOffsets) -> Self {
        Self {
            fields: OffsetFields::all(),
            values,
        }
    }
}

/// Tri-state toggle used by requests that may leave a flag untouched.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Toggle {
    #[default]
    Unchanged = 0,
    Enable = 1,
    Disable = 2,
}

impl Toggle {
    pub fn from_raw(raw: u32) -> Toggle {
        match raw {
            1 => Toggle::Enable,
            2 => Toggle::Disable,
            _ => Toggle::Unchanged,
        }
    }

    pub fn from_bool(enable: bool) -> Toggle {
        if enable {
            Toggle::Enable
        } else {
            Toggle::Disable
        }
    }

    pub fn apply(self, flag: &mut bool) {
        match self {
            Toggle::Enable => *flag = true,
            Toggle::Disable => *flag = false,
            Toggle::Unchanged => {}
        }
    }
}

/// Snapshot of a device record as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub device_class: DeviceClass,
    pub mode: DeviceMode,
    pub offsets_enabled: bool,
    pub button_mapping_enabled: bool,
    pub redirect_suspended: bool,
    pub step_detection_enabled: bool,
    /// Partner device id, `INVALID_DEVICE_INDEX` when unpaired.
    pub partner_id: u32,
}

/// Build the quaternion for a yaw/pitch/roll rotation given in degrees.
///
/// Yaw turns about +Y, pitch about +X, roll about +Z, applied in that order
/// (`R = Ry(yaw) * Rx(pitch) * Rz(roll)`).
pub fn rotation_from_yaw_pitch_roll_deg(yaw: f64, pitch: f64, roll: f64) -> Quaternion<f64> {
    let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw.to_radians());
    let pitch = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), pitch.to_radians());
    let roll = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), roll.to_radians());
    (yaw * pitch * roll).into_inner()
}

/// Inverse of [`rotation_from_yaw_pitch_roll_deg`]: `[yaw, pitch, roll]` in degrees.
pub fn yaw_pitch_roll_deg(q: &Quaternion<f64>) -> [f64; 3] {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let yaw = (2.0 * (x * z + w * y)).atan2(1.0 - 2.0 * (x * x + y * y));
    let pitch = (2.0 * (w * x - y * z)).clamp(-1.0, 1.0).asin();
    let roll = (2.0 * (x * y + w * z)).atan2(1.0 - 2.0 * (x * x + z * z));
    [yaw.to_degrees(), pitch.to_degrees(), roll.to_degrees()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_bounds() {
        assert!(DeviceId::new(0).is_ok());
        assert_eq!(DeviceId::new(63).unwrap().raw(), 63);
        assert_eq!(DeviceId::new(64), Err(ManipError::InvalidId(64)));
    }

    #[test]
    fn test_yaw_pitch_roll_roundtrip() {
        for &(yaw, pitch, roll) in &[(0.0, 0.0, 0.0), (30.0, -20.0, 10.0), (-120.0, 45.0, 170.0)] {
            let q = rotation_from_yaw_pitch_roll_deg(yaw, pitch, roll);
            let back = yaw_pitch_roll_deg(&q);
            assert!((back[0] - yaw).abs() < 1e-9, "yaw {} vs {}", back[0], yaw);
            assert!((back[1] - pitch).abs() < 1e-9, "pitch {} vs {}", back[1], pitch);
            assert!((back[2] - roll).abs() < 1e-9, "roll {} vs {}", back[2], roll);
        }
    }

    #[test]
    fn test_yaw_turns_about_y() {
        let q = UnitQuaternion::from_quaternion(rotation_from_yaw_pitch_roll_deg(90.0, 0.0, 0.0));
        let v = q.transform_vector(&Vector3::new(0.0, 0.0, -1.0));
        assert!((v - Vector3::new(-1.0, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_vel_acc_mode_from_raw() {
        assert_eq!(VelAccMode::try_from(2).unwrap(), VelAccMode::Blended);
        assert_eq!(
            VelAccMode::try_from(7),
            Err(ManipError::InvalidOperation(7))
        );
    }

    #[test]
    fn test_toggle_apply() {
        let mut flag = false;
        Toggle::Unchanged.apply(&mut flag);
        assert!(!flag);
        Toggle::Enable.apply(&mut flag);
        assert!(flag);
        Toggle::Disable.apply(&mut flag);
        assert!(!flag);
    }
}
