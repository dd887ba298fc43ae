use crate::types::{
    AxisEvent, AxisState, ButtonEvent, ButtonEventType, ControllerState, DeviceClass, DeviceInfo,
    DeviceMode, DeviceOffsets, OffsetFields, OffsetUpdate, Pose, Toggle, CONTROLLER_AXIS_COUNT,
};
use crate::virtual_device::{PropertyValue, VirtualDeviceInfo};
use crate::{ManipError, Result};
use bytes::{Buf, BufMut, BytesMut};
use nalgebra::{Matrix3x4, Quaternion, Vector3};

/// Version compiled into both ends; `ClientConnect` rejects a mismatch.
pub const PROTOCOL_VERSION: u32 = 3;

// -- Frame geometry --
pub const FRAME_SIZE: usize = 512;
pub const REQUEST_HEADER_SIZE: usize = 24;
pub const REPLY_HEADER_SIZE: usize = 16;

/// Fixed width of every string field, including the terminating NUL.
pub const STRING_FIELD_SIZE: usize = 128;

pub const MAX_BUTTON_EVENTS: usize = 8;
pub const MAX_AXIS_EVENTS: usize = 8;
pub const MAX_BUTTON_MAPPING_VALUES: usize = 64;

/// Default inbound queue depth.
pub const QUEUE_CAPACITY: usize = 100;

pub type Frame = [u8; FRAME_SIZE];

// -- Request types --
pub const REQ_CLIENT_CONNECT: u32 = 1;
pub const REQ_CLIENT_DISCONNECT: u32 = 2;
pub const REQ_PING: u32 = 3;
pub const REQ_BUTTON_EVENTS: u32 = 10;
pub const REQ_AXIS_EVENTS: u32 = 11;
pub const REQ_POSE_UPDATE: u32 = 12;
pub const REQ_VD_GET_COUNT: u32 = 20;
pub const REQ_VD_GET_INFO: u32 = 21;
pub const REQ_VD_GET_POSE: u32 = 22;
pub const REQ_VD_GET_CONTROLLER_STATE: u32 = 23;
pub const REQ_VD_ADD: u32 = 24;
pub const REQ_VD_PUBLISH: u32 = 25;
pub const REQ_VD_SET_PROPERTY: u32 = 26;
pub const REQ_VD_REMOVE_PROPERTY: u32 = 27;
pub const REQ_VD_SET_POSE: u32 = 28;
pub const REQ_VD_SET_CONTROLLER_STATE: u32 = 29;
pub const REQ_DM_GET_INFO: u32 = 40;
pub const REQ_DM_GET_OFFSETS: u32 = 41;
pub const REQ_DM_SET_OFFSETS: u32 = 42;
pub const REQ_DM_DEFAULT_MODE: u32 = 43;
pub const REQ_DM_FAKE_DISCONNECTED: u32 = 44;
pub const REQ_DM_REDIRECT: u32 = 45;
pub const REQ_DM_SWAP: u32 = 46;
pub const REQ_DM_MOTION_COMPENSATION: u32 = 47;
pub const REQ_DM_MOTION_COMPENSATION_PROPS: u32 = 48;
pub const REQ_DM_STEP_DETECTION: u32 = 49;
pub const REQ_DM_BUTTON_MAPPING: u32 = 50;
pub const REQ_DM_HAPTIC_PULSE: u32 = 51;

// -- Reply types --
pub const REP_GENERIC: u32 = 100;
pub const REP_CLIENT_CONNECT: u32 = 101;
pub const REP_PING: u32 = 102;
pub const REP_VD_COUNT: u32 = 120;
pub const REP_VD_INFO: u32 = 121;
pub const REP_VD_POSE: u32 = 122;
pub const REP_VD_CONTROLLER_STATE: u32 = 123;
pub const REP_VD_ADD: u32 = 124;
pub const REP_DM_INFO: u32 = 140;
pub const REP_DM_OFFSETS: u32 = 141;

// -- Property value tags --
const PROP_TAG_INVALID: u32 = 0;
const PROP_TAG_BOOL: u32 = 1;
const PROP_TAG_FLOAT: u32 = 2;
const PROP_TAG_INT32: u32 = 3;
const PROP_TAG_UINT64: u32 = 4;
const PROP_TAG_STRING: u32 = 5;
const PROP_TAG_VECTOR3: u32 = 6;
const PROP_TAG_MATRIX34: u32 = 7;

/// Reply status vocabulary.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    InvalidId = 1,
    NotFound = 2,
    InvalidType = 3,
    InvalidOperation = 4,
    TooManyDevices = 5,
    AlreadyInUse = 6,
    MissingProperty = 7,
    InvalidVersion = 8,
    UnknownError = 9,
}

impl Status {
    pub fn from_raw(raw: u32) -> Status {
        match raw {
            0 => Status::Ok,
            1 => Status::InvalidId,
            2 => Status::NotFound,
            3 => Status::InvalidType,
            4 => Status::InvalidOperation,
            5 => Status::TooManyDevices,
            6 => Status::AlreadyInUse,
            7 => Status::MissingProperty,
            8 => Status::InvalidVersion,
            _ => Status::UnknownError,
        }
    }
}

/// Envelope fields carried by every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub client_id: u32,
    /// 0 means the sender does not want a reply.
    pub message_id: u64,
    /// Milliseconds since the Unix epoch, stamped by the sender.
    pub timestamp: i64,
}

/// Step-detection tuning request. Which fields are read depends on `operation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDetectionRequest {
    pub operation: u32,
    pub enable: bool,
    /// Window seconds (op 2), jog threshold (op 4) or run threshold (op 5).
    pub value: f64,
    pub hmd_threshold: Vector3<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    ClientConnect {
        protocol_version: u32,
        reply_queue: String,
    },
    ClientDisconnect,
    Ping {
        nonce: u64,
    },
    ButtonEvents(Vec<ButtonEvent>),
    AxisEvents(Vec<AxisEvent>),
    PoseUpdate {
        device_id: u32,
        pose: Pose,
    },
    GetVirtualDeviceCount,
    GetVirtualDeviceInfo {
        virtual_id: u32,
    },
    GetVirtualDevicePose {
        virtual_id: u32,
    },
    GetVirtualControllerState {
        virtual_id: u32,
    },
    AddVirtualDevice {
        device_type: u32,
        serial: String,
    },
    PublishVirtualDevice {
        virtual_id: u32,
    },
    SetVirtualDeviceProperty {
        virtual_id: u32,
        property: u32,
        /// `None` when the sender used a value type this side does not know.
        value: Option<PropertyValue>,
    },
    RemoveVirtualDeviceProperty {
        virtual_id: u32,
        property: u32,
    },
    SetVirtualDevicePose {
        virtual_id: u32,
        pose: Pose,
    },
    SetVirtualControllerState {
        virtual_id: u32,
        state: ControllerState,
    },
    GetDeviceInfo {
        device_id: u32,
    },
    GetDeviceOffsets {
        device_id: u32,
    },
    SetDeviceOffsets {
        device_id: u32,
        operation: u32,
        enable: Toggle,
        update: OffsetUpdate,
    },
    DefaultMode {
        device_id: u32,
    },
    FakeDisconnectedMode {
        device_id: u32,
    },
    RedirectMode {
        device_id: u32,
        target_id: u32,
    },
    SwapMode {
        device_id: u32,
        target_id: u32,
    },
    MotionCompensationMode {
        device_id: u32,
        vel_acc_mode: u32,
    },
    SetMotionCompensationProperties {
        vel_acc_mode: u32,
    },
    StepDetection(StepDetectionRequest),
    ButtonMapping {
        device_id: u32,
        enable: Toggle,
        operation: u32,
        /// Flat `source, target` pairs for add, plain sources for erase.
        values: Vec<u32>,
    },
    TriggerHapticPulse {
        device_id: u32,
        axis_id: u32,
        duration_micros: u16,
        direct: bool,
    },
}

impl RequestBody {
    pub fn type_code(&self) -> u32 {
        match self {
            RequestBody::ClientConnect { .. } => REQ_CLIENT_CONNECT,
            RequestBody::ClientDisconnect => REQ_CLIENT_DISCONNECT,
            RequestBody::Ping { .. } => REQ_PING,
            RequestBody::ButtonEvents(_) => REQ_BUTTON_EVENTS,
            RequestBody::AxisEvents(_) => REQ_AXIS_EVENTS,
            RequestBody::PoseUpdate { .. } => REQ_POSE_UPDATE,
            RequestBody::GetVirtualDeviceCount => REQ_VD_GET_COUNT,
            RequestBody::GetVirtualDeviceInfo { .. } => REQ_VD_GET_INFO,
            RequestBody::GetVirtualDevicePose { .. } => REQ_VD_GET_POSE,
            RequestBody::GetVirtualControllerState { .. } => REQ_VD_GET_CONTROLLER_STATE,
            RequestBody::AddVirtualDevice { .. } => REQ_VD_ADD,
            RequestBody::PublishVirtualDevice { .. } => REQ_VD_PUBLISH,
            RequestBody::SetVirtualDeviceProperty { .. } => REQ_VD_SET_PROPERTY,
            RequestBody::RemoveVirtualDeviceProperty { .. } => REQ_VD_REMOVE_PROPERTY,
            RequestBody::SetVirtualDevicePose { .. } => REQ_VD_SET_POSE,
            RequestBody::SetVirtualControllerState { .. } => REQ_VD_SET_CONTROLLER_STATE,
            RequestBody::GetDeviceInfo { .. } => REQ_DM_GET_INFO,
            RequestBody::GetDeviceOffsets { .. } => REQ_DM_GET_OFFSETS,
            RequestBody::SetDeviceOffsets { .. } => REQ_DM_SET_OFFSETS,
            RequestBody::DefaultMode { .. } => REQ_DM_DEFAULT_MODE,
            RequestBody::FakeDisconnectedMode { .. } => REQ_DM_FAKE_DISCONNECTED,
            RequestBody::RedirectMode { .. } => REQ_DM_REDIRECT,
            RequestBody::SwapMode { .. } => REQ_DM_SWAP,
            RequestBody::MotionCompensationMode { .. } => REQ_DM_MOTION_COMPENSATION,
            RequestBody::SetMotionCompensationProperties { .. } => REQ_DM_MOTION_COMPENSATION_PROPS,
            RequestBody::StepDetection(_) => REQ_DM_STEP_DETECTION,
            RequestBody::ButtonMapping { .. } => REQ_DM_BUTTON_MAPPING,
            RequestBody::TriggerHapticPulse { .. } => REQ_DM_HAPTIC_PULSE,
        }
    }

    /// Reply body sent alongside a failed status.
    ///
    /// Most failures carry a generic body; `ClientConnect` still needs its
    /// typed reply and `AlreadyInUse` reports the existing virtual id.
    pub fn error_body(&self, err: &ManipError) -> ReplyBody {
        match (self, err) {
            (RequestBody::ClientConnect { .. }, _) => ReplyBody::ClientConnect {
                client_id: 0,
                protocol_version: PROTOCOL_VERSION,
            },
            (RequestBody::AddVirtualDevice { .. }, ManipError::AlreadyInUse(id)) => {
                ReplyBody::AddVirtualDevice { virtual_id: *id }
            }
            _ => ReplyBody::Generic,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub header: RequestHeader,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Generic,
    ClientConnect {
        client_id: u32,
        protocol_version: u32,
    },
    Ping {
        nonce: u64,
    },
    VirtualDeviceCount(u32),
    VirtualDeviceInfo(VirtualDeviceInfo),
    VirtualDevicePose(Pose),
    VirtualControllerState(ControllerState),
    AddVirtualDevice {
        virtual_id: u32,
    },
    DeviceInfo(DeviceInfo),
    DeviceOffsets {
        device_id: u32,
        offsets_enabled: bool,
        offsets: DeviceOffsets,
    },
}

impl ReplyBody {
    pub fn type_code(&self) -> u32 {
        match self {
            ReplyBody::Generic => REP_GENERIC,
            ReplyBody::ClientConnect { .. } => REP_CLIENT_CONNECT,
            ReplyBody::Ping { .. } => REP_PING,
            ReplyBody::VirtualDeviceCount(_) => REP_VD_COUNT,
            ReplyBody::VirtualDeviceInfo(_) => REP_VD_INFO,
            ReplyBody::VirtualDevicePose(_) => REP_VD_POSE,
            ReplyBody::VirtualControllerState(_) => REP_VD_CONTROLLER_STATE,
            ReplyBody::AddVirtualDevice { .. } => REP_VD_ADD,
            ReplyBody::DeviceInfo(_) => REP_DM_INFO,
            ReplyBody::DeviceOffsets { .. } => REP_DM_OFFSETS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub message_id: u64,
    pub status: Status,
    pub body: ReplyBody,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn into_frame(buf: BytesMut) -> Result<Frame> {
    if buf.len() > FRAME_SIZE {
        return Err(ManipError::MalformedFrame(format!(
            "encoded message is {} bytes (frame is {})",
            buf.len(),
            FRAME_SIZE
        )));
    }
    let mut frame = [0u8; FRAME_SIZE];
    frame[..buf.len()].copy_from_slice(&buf);
    Ok(frame)
}

/// Write `s` as a fixed-width NUL-terminated field, truncating on a char boundary.
fn put_string(buf: &mut BytesMut, s: &str) {
    let mut len = s.len().min(STRING_FIELD_SIZE - 1);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_slice(&s.as_bytes()[..len]);
    buf.put_bytes(0, STRING_FIELD_SIZE - len);
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

fn put_quaternion(buf: &mut BytesMut, q: &Quaternion<f64>) {
    buf.put_f64_le(q.w);
    buf.put_f64_le(q.i);
    buf.put_f64_le(q.j);
    buf.put_f64_le(q.k);
}

fn put_vector3(buf: &mut BytesMut, v: &Vector3<f64>) {
    buf.put_f64_le(v.x);
    buf.put_f64_le(v.y);
    buf.put_f64_le(v.z);
}

fn put_pose(buf: &mut BytesMut, pose: &Pose) {
    buf.put_f64_le(pose.time_offset);
    put_quaternion(buf, &pose.world_from_driver_rotation);
    put_vector3(buf, &pose.world_from_driver_translation);
    put_quaternion(buf, &pose.driver_from_head_rotation);
    put_vector3(buf, &pose.driver_from_head_translation);
    put_vector3(buf, &pose.position);
    put_quaternion(buf, &pose.rotation);
    put_vector3(buf, &pose.velocity);
    put_vector3(buf, &pose.acceleration);
    put_vector3(buf, &pose.angular_velocity);
    put_vector3(buf, &pose.angular_acceleration);
    put_bool(buf, pose.pose_is_valid);
    put_bool(buf, pose.device_is_connected);
}

fn put_offsets(buf: &mut BytesMut, offsets: &DeviceOffsets) {
    put_quaternion(buf, &offsets.world_from_driver_rotation);
    put_vector3(buf, &offsets.world_from_driver_translation);
    put_quaternion(buf, &offsets.driver_from_head_rotation);
    put_vector3(buf, &offsets.driver_from_head_translation);
    put_quaternion(buf, &offsets.device_rotation);
    put_vector3(buf, &offsets.device_translation);
}

fn put_controller_state(buf: &mut BytesMut, state: &ControllerState) {
    buf.put_u32_le(state.packet_num);
    buf.put_u64_le(state.buttons_pressed);
    buf.put_u64_le(state.buttons_touched);
    for axis in &state.axes {
        buf.put_f32_le(axis.x);
        buf.put_f32_le(axis.y);
    }
}

fn put_property_value(buf: &mut BytesMut, value: Option<&PropertyValue>) {
    match value {
        None => buf.put_u32_le(PROP_TAG_INVALID),
        Some(PropertyValue::Bool(v)) => {
            buf.put_u32_le(PROP_TAG_BOOL);
            put_bool(buf, *v);
        }
        Some(PropertyValue::Float(v)) => {
            buf.put_u32_le(PROP_TAG_FLOAT);
            buf.put_f32_le(*v);
        }
        Some(PropertyValue::Int32(v)) => {
            buf.put_u32_le(PROP_TAG_INT32);
            buf.put_i32_le(*v);
        }
        Some(PropertyValue::Uint64(v)) => {
            buf.put_u32_le(PROP_TAG_UINT64);
            buf.put_u64_le(*v);
        }
        Some(PropertyValue::String(v)) => {
            buf.put_u32_le(PROP_TAG_STRING);
            put_string(buf, v);
        }
        Some(PropertyValue::Vector3(v)) => {
            buf.put_u32_le(PROP_TAG_VECTOR3);
            put_vector3(buf, v);
        }
        Some(PropertyValue::Matrix34(m)) => {
            buf.put_u32_le(PROP_TAG_MATRIX34);
            for row in 0..3 {
                for col in 0..4 {
                    buf.put_f64_le(m[(row, col)]);
                }
            }
        }
    }
}

/// Encode a request into one frame.
pub fn encode_request(request: &Request) -> Result<Frame> {
    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    buf.put_u32_le(request.body.type_code());
    buf.put_u32_le(request.header.client_id);
    buf.put_u64_le(request.header.message_id);
    buf.put_i64_le(request.header.timestamp);

    match &request.body {
        RequestBody::ClientConnect {
            protocol_version,
            reply_queue,
        } => {
            buf.put_u32_le(*protocol_version);
            put_string(&mut buf, reply_queue);
        }
        RequestBody::ClientDisconnect
        | RequestBody::GetVirtualDeviceCount => {}
        RequestBody::Ping { nonce } => buf.put_u64_le(*nonce),
        RequestBody::ButtonEvents(events) => {
            if events.len() > MAX_BUTTON_EVENTS {
                return Err(ManipError::MalformedFrame(format!(
                    "{} button events (max {})",
                    events.len(),
                    MAX_BUTTON_EVENTS
                )));
            }
            buf.put_u32_le(events.len() as u32);
            for event in events {
                buf.put_u32_le(event.device_id);
                buf.put_u32_le(event.kind as u32);
                buf.put_u32_le(event.button);
                buf.put_f64_le(event.time_offset);
            }
        }
        RequestBody::AxisEvents(events) => {
            if events.len() > MAX_AXIS_EVENTS {
                return Err(ManipError::MalformedFrame(format!(
                    "{} axis events (max {})",
                    events.len(),
                    MAX_AXIS_EVENTS
                )));
            }
            buf.put_u32_le(events.len() as u32);
            for event in events {
                buf.put_u32_le(event.device_id);
                buf.put_u32_le(event.axis);
                buf.put_f32_le(event.state.x);
                buf.put_f32_le(event.state.y);
            }
        }
        RequestBody::PoseUpdate { device_id, pose } => {
            buf.put_u32_le(*device_id);
            put_pose(&mut buf, pose);
        }
        RequestBody::GetVirtualDeviceInfo { virtual_id }
        | RequestBody::GetVirtualDevicePose { virtual_id }
        | RequestBody::GetVirtualControllerState { virtual_id }
        | RequestBody::PublishVirtualDevice { virtual_id } => buf.put_u32_le(*virtual_id),
        RequestBody::AddVirtualDevice {
            device_type,
            serial,
        } => {
            buf.put_u32_le(*device_type);
            put_string(&mut buf, serial);
        }
        RequestBody::SetVirtualDeviceProperty {
            virtual_id,
            property,
            value,
        } => {
            buf.put_u32_le(*virtual_id);
            buf.put_u32_le(*property);
            put_property_value(&mut buf, value.as_ref());
        }
        RequestBody::RemoveVirtualDeviceProperty {
            virtual_id,
            property,
        } => {
            buf.put_u32_le(*virtual_id);
            buf.put_u32_le(*property);
        }
        RequestBody::SetVirtualDevicePose { virtual_id, pose } => {
            buf.put_u32_le(*virtual_id);
            put_pose(&mut buf, pose);
        }
        RequestBody::SetVirtualControllerState { virtual_id, state } => {
            buf.put_u32_le(*virtual_id);
            put_controller_state(&mut buf, state);
        }
        RequestBody::GetDeviceInfo { device_id }
        | RequestBody::GetDeviceOffsets { device_id }
        | RequestBody::DefaultMode { device_id }
        | RequestBody::FakeDisconnectedMode { device_id } => buf.put_u32_le(*device_id),
        RequestBody::SetDeviceOffsets {
            device_id,
            operation,
            enable,
            update,
        } => {
            buf.put_u32_le(*device_id);
            buf.put_u32_le(*operation);
            buf.put_u32_le(*enable as u32);
            buf.put_u32_le(update.fields.bits());
            put_offsets(&mut buf, &update.values);
        }
        RequestBody::RedirectMode {
            device_id,
            target_id,
        }
        | RequestBody::SwapMode {
            device_id,
            target_id,
        } => {
            buf.put_u32_le(*device_id);
            buf.put_u32_le(*target_id);
        }
        RequestBody::MotionCompensationMode {
            device_id,
            vel_acc_mode,
        } => {
            buf.put_u32_le(*device_id);
            buf.put_u32_le(*vel_acc_mode);
        }
        RequestBody::SetMotionCompensationProperties { vel_acc_mode } => {
            buf.put_u32_le(*vel_acc_mode)
        }
        RequestBody::StepDetection(step) => {
            buf.put_u32_le(step.operation);
            put_bool(&mut buf, step.enable);
            buf.put_f64_le(step.value);
            put_vector3(&mut buf, &step.hmd_threshold);
        }
        RequestBody::ButtonMapping {
            device_id,
            enable,
            operation,
            values,
        } => {
            if values.len() > MAX_BUTTON_MAPPING_VALUES {
                return Err(ManipError::MalformedFrame(format!(
                    "{} mapping values (max {})",
                    values.len(),
                    MAX_BUTTON_MAPPING_VALUES
                )));
            }
            buf.put_u32_le(*device_id);
            buf.put_u32_le(*enable as u32);
            buf.put_u32_le(*operation);
            buf.put_u32_le(values.len() as u32);
            for value in values {
                buf.put_u32_le(*value);
            }
        }
        RequestBody::TriggerHapticPulse {
            device_id,
            axis_id,
            duration_micros,
            direct,
        } => {
            buf.put_u32_le(*device_id);
            buf.put_u32_le(*axis_id);
            buf.put_u16_le(*duration_micros);
            put_bool(&mut buf, *direct);
        }
    }

    into_frame(buf)
}

/// Encode a reply into one frame.
pub fn encode_reply(reply: &Reply) -> Result<Frame> {
    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    buf.put_u32_le(reply.body.type_code());
    buf.put_u32_le(reply.status as u32);
    buf.put_u64_le(reply.message_id);

    match &reply.body {
        ReplyBody::Generic => {}
        ReplyBody::ClientConnect {
            client_id,
            protocol_version,
        } => {
            buf.put_u32_le(*client_id);
            buf.put_u32_le(*protocol_version);
        }
        ReplyBody::Ping { nonce } => buf.put_u64_le(*nonce),
        ReplyBody::VirtualDeviceCount(count) => buf.put_u32_le(*count),
        ReplyBody::VirtualDeviceInfo(info) => {
            buf.put_u32_le(info.virtual_id);
            buf.put_u32_le(info.host_id);
            buf.put_u32_le(info.device_type);
            put_bool(&mut buf, info.published);
            put_string(&mut buf, &info.serial);
        }
        ReplyBody::VirtualDevicePose(pose) => put_pose(&mut buf, pose),
        ReplyBody::VirtualControllerState(state) => put_controller_state(&mut buf, state),
        ReplyBody::AddVirtualDevice { virtual_id } => buf.put_u32_le(*virtual_id),
        ReplyBody::DeviceInfo(info) => {
            buf.put_u32_le(info.device_id);
            buf.put_u32_le(info.device_class as u32);
            buf.put_u32_le(info.mode as u32);
            put_bool(&mut buf, info.offsets_enabled);
            put_bool(&mut buf, info.button_mapping_enabled);
            put_bool(&mut buf, info.redirect_suspended);
            put_bool(&mut buf, info.step_detection_enabled);
            buf.put_u32_le(info.partner_id);
        }
        ReplyBody::DeviceOffsets {
            device_id,
            offsets_enabled,
            offsets,
        } => {
            buf.put_u32_le(*device_id);
            put_bool(&mut buf, *offsets_enabled);
            put_offsets(&mut buf, offsets);
        }
    }

    into_frame(buf)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Extract a null-terminated string from a byte slice.
pub fn extract_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

fn get_string(data: &mut &[u8]) -> String {
    let s = extract_string(&data[..STRING_FIELD_SIZE]);
    data.advance(STRING_FIELD_SIZE);
    s
}

fn get_bool(data: &mut &[u8]) -> bool {
    data.get_u8() != 0
}

fn get_quaternion(data: &mut &[u8]) -> Quaternion<f64> {
    let w = data.get_f64_le();
    let i = data.get_f64_le();
    let j = data.get_f64_le();
    let k = data.get_f64_le();
    Quaternion::new(w, i, j, k)
}

fn get_vector3(data: &mut &[u8]) -> Vector3<f64> {
    let x = data.get_f64_le();
    let y = data.get_f64_le();
    let z = data.get_f64_le();
    Vector3::new(x, y, z)
}

fn get_pose(data: &mut &[u8]) -> Pose {
    Pose {
        time_offset: data.get_f64_le(),
        world_from_driver_rotation: get_quaternion(data),
        world_from_driver_translation: get_vector3(data),
        driver_from_head_rotation: get_quaternion(data),
        driver_from_head_translation: get_vector3(data),
        position: get_vector3(data),
        rotation: get_quaternion(data),
        velocity: get_vector3(data),
        acceleration: get_vector3(data),
        angular_velocity: get_vector3(data),
        angular_acceleration: get_vector3(data),
        pose_is_valid: get_bool(data),
        device_is_connected: get_bool(data),
    }
}

fn get_offsets(data: &mut &[u8]) -> DeviceOffsets {
    DeviceOffsets {
        world_from_driver_rotation: get_quaternion(data),
        world_from_driver_translation: get_vector3(data),
        driver_from_head_rotation: get_quaternion(data),
        driver_from_head_translation: get_vector3(data),
        device_rotation: get_quaternion(data),
        device_translation: get_vector3(data),
    }
}

fn get_controller_state(data: &mut &[u8]) -> ControllerState {
    let packet_num = data.get_u32_le();
    let buttons_pressed = data.get_u64_le();
    let buttons_touched = data.get_u64_le();
    let mut axes = [AxisState::default(); CONTROLLER_AXIS_COUNT];
    for axis in axes.iter_mut() {
        axis.x = data.get_f32_le();
        axis.y = data.get_f32_le();
    }
    ControllerState {
        packet_num,
        buttons_pressed,
        buttons_touched,
        axes,
    }
}

fn get_property_value(data: &mut &[u8]) -> Option<PropertyValue> {
    match data.get_u32_le() {
        PROP_TAG_BOOL => Some(PropertyValue::Bool(get_bool(data))),
        PROP_TAG_FLOAT => Some(PropertyValue::Float(data.get_f32_le())),
        PROP_TAG_INT32 => Some(PropertyValue::Int32(data.get_i32_le())),
        PROP_TAG_UINT64 => Some(PropertyValue::Uint64(data.get_u64_le())),
        PROP_TAG_STRING => Some(PropertyValue::String(get_string(data))),
        PROP_TAG_VECTOR3 => Some(PropertyValue::Vector3(get_vector3(data))),
        PROP_TAG_MATRIX34 => {
            let mut m = Matrix3x4::zeros();
            for row in 0..3 {
                for col in 0..4 {
                    m[(row, col)] = data.get_f64_le();
                }
            }
            Some(PropertyValue::Matrix34(m))
        }
        _ => None,
    }
}

fn get_count(data: &mut &[u8], max: usize, what: &str) -> Result<usize> {
    let count = data.get_u32_le() as usize;
    if count > max {
        return Err(ManipError::MalformedFrame(format!(
            "{} {} (max {})",
            count, what, max
        )));
    }
    Ok(count)
}

/// Decode a request frame.
///
/// Every field sits at a fixed offset well inside the frame, so reads
/// cannot run past the end; only counts and enums need validating.
pub fn decode_request(frame: &Frame) -> Result<Request> {
    let mut data: &[u8] = &frame[..];
    let type_code = data.get_u32_le();
    let header = RequestHeader {
        client_id: data.get_u32_le(),
        message_id: data.get_u64_le(),
        timestamp: data.get_i64_le(),
    };
    let data = &mut data;

    let body = match type_code {
        REQ_CLIENT_CONNECT => RequestBody::ClientConnect {
            protocol_version: data.get_u32_le(),
            reply_queue: get_string(data),
        },
        REQ_CLIENT_DISCONNECT => RequestBody::ClientDisconnect,
        REQ_PING => RequestBody::Ping {
            nonce: data.get_u64_le(),
        },
        REQ_BUTTON_EVENTS => {
            let count = get_count(data, MAX_BUTTON_EVENTS, "button events")?;
            let mut events = Vec::with_capacity(count);
            for _ in 0..count {
                let device_id = data.get_u32_le();
                let raw_kind = data.get_u32_le();
                let kind = ButtonEventType::from_raw(raw_kind).ok_or_else(|| {
                    ManipError::MalformedFrame(format!("button event type {}", raw_kind))
                })?;
                events.push(ButtonEvent {
                    device_id,
                    kind,
                    button: data.get_u32_le(),
                    time_offset: data.get_f64_le(),
                });
            }
            RequestBody::ButtonEvents(events)
        }
        REQ_AXIS_EVENTS => {
            let count = get_count(data, MAX_AXIS_EVENTS, "axis events")?;
            let mut events = Vec::with_capacity(count);
            for _ in 0..count {
                events.push(AxisEvent {
                    device_id: data.get_u32_le(),
                    axis: data.get_u32_le(),
                    state: AxisState {
                        x: data.get_f32_le(),
                        y: data.get_f32_le(),
                    },
                });
            }
            RequestBody::AxisEvents(events)
        }
        REQ_POSE_UPDATE => RequestBody::PoseUpdate {
            device_id: data.get_u32_le(),
            pose: get_pose(data),
        },
        REQ_VD_GET_COUNT => RequestBody::GetVirtualDeviceCount,
        REQ_VD_GET_INFO => RequestBody::GetVirtualDeviceInfo {
            virtual_id: data.get_u32_le(),
        },
        REQ_VD_GET_POSE => RequestBody::GetVirtualDevicePose {
            virtual_id: data.get_u32_le(),
        },
        REQ_VD_GET_CONTROLLER_STATE => RequestBody::GetVirtualControllerState {
            virtual_id: data.get_u32_le(),
        },
        REQ_VD_ADD => RequestBody::AddVirtualDevice {
            device_type: data.get_u32_le(),
            serial: get_string(data),
        },
        REQ_VD_PUBLISH => RequestBody::PublishVirtualDevice {
            virtual_id: data.get_u32_le(),
        },
        REQ_VD_SET_PROPERTY => RequestBody::SetVirtualDeviceProperty {
            virtual_id: data.get_u32_le(),
            property: data.get_u32_le(),
            value: get_property_value(data),
        },
        REQ_VD_REMOVE_PROPERTY => RequestBody::RemoveVirtualDeviceProperty {
            virtual_id: data.get_u32_le(),
            property: data.get_u32_le(),
        },
        REQ_VD_SET_POSE => RequestBody::SetVirtualDevicePose {
            virtual_id: data.get_u32_le(),
            pose: get_pose(data),
        },
        REQ_VD_SET_CONTROLLER_STATE => RequestBody::SetVirtualControllerState {
            virtual_id: data.get_u32_le(),
            state: get_controller_state(data),
        },
        REQ_DM_GET_INFO => RequestBody::GetDeviceInfo {
            device_id: data.get_u32_le(),
        },
        REQ_DM_GET_OFFSETS => RequestBody::GetDeviceOffsets {
            device_id: data.get_u32_le(),
        },
        REQ_DM_SET_OFFSETS => {
            let device_id = data.get_u32_le();
            let operation = data.get_u32_le();
            let enable = Toggle::from_raw(data.get_u32_le());
            let fields = OffsetFields::from_bits_truncate(data.get_u32_le());
            let values = get_offsets(data);
            RequestBody::SetDeviceOffsets {
                device_id,
                operation,
                enable,
                update: OffsetUpdate { fields, values },
            }
        }
        REQ_DM_DEFAULT_MODE => RequestBody::DefaultMode {
            device_id: data.get_u32_le(),
        },
        REQ_DM_FAKE_DISCONNECTED => RequestBody::FakeDisconnectedMode {
            device_id: data.get_u32_le(),
        },
        REQ_DM_REDIRECT => RequestBody::RedirectMode {
            device_id: data.get_u32_le(),
            target_id: data.get_u32_le(),
        },
        REQ_DM_SWAP => RequestBody::SwapMode {
            device_id: data.get_u32_le(),
            target_id: data.get_u32_le(),
        },
        REQ_DM_MOTION_COMPENSATION => RequestBody::MotionCompensationMode {
            device_id: data.get_u32_le(),
            vel_acc_mode: data.get_u32_le(),
        },
        REQ_DM_MOTION_COMPENSATION_PROPS => RequestBody::SetMotionCompensationProperties {
            vel_acc_mode: data.get_u32_le(),
        },
        REQ_DM_STEP_DETECTION => RequestBody::StepDetection(StepDetectionRequest {
            operation: data.get_u32_le(),
            enable: get_bool(data),
            value: data.get_f64_le(),
            hmd_threshold: get_vector3(data),
        }),
        REQ_DM_BUTTON_MAPPING => {
            let device_id = data.get_u32_le();
            let enable = Toggle::from_raw(data.get_u32_le());
            let operation = data.get_u32_le();
            let count = get_count(data, MAX_BUTTON_MAPPING_VALUES, "mapping values")?;
            let values = (0..count).map(|_| data.get_u32_le()).collect();
            RequestBody::ButtonMapping {
                device_id,
                enable,
                operation,
                values,
            }
        }
        REQ_DM_HAPTIC_PULSE => RequestBody::TriggerHapticPulse {
            device_id: data.get_u32_le(),
            axis_id: data.get_u32_le(),
            duration_micros: data.get_u16_le(),
            direct: get_bool(data),
        },
        other => return Err(ManipError::UnknownMessage(other)),
    };

    Ok(Request { header, body })
}

fn get_device_class(data: &mut &[u8]) -> DeviceClass {
    DeviceClass::from_raw(data.get_u32_le())
}

fn get_device_mode(data: &mut &[u8]) -> Result<DeviceMode> {
    let raw = data.get_u32_le();
    DeviceMode::from_raw(raw).ok_or_else(|| ManipError::MalformedFrame(format!("device mode {}", raw)))
}

/// Decode a reply frame.
pub fn decode_reply(frame: &Frame) -> Result<Reply> {
    let mut data: &[u8] = &frame[..];
    let type_code = data.get_u32_le();
    let status = Status::from_raw(data.get_u32_le());
    let message_id = data.get_u64_le();
    let data = &mut data;

    let body = match type_code {
        REP_GENERIC => ReplyBody::Generic,
        REP_CLIENT_CONNECT => ReplyBody::ClientConnect {
            client_id: data.get_u32_le(),
            protocol_version: data.get_u32_le(),
        },
        REP_PING => ReplyBody::Ping {
            nonce: data.get_u64_le(),
        },
        REP_VD_COUNT => ReplyBody::VirtualDeviceCount(data.get_u32_le()),
        REP_VD_INFO => ReplyBody::VirtualDeviceInfo(VirtualDeviceInfo {
            virtual_id: data.get_u32_le(),
            host_id: data.get_u32_le(),
            device_type: data.get_u32_le(),
            published: get_bool(data),
            serial: get_string(data),
        }),
        REP_VD_POSE => ReplyBody::VirtualDevicePose(get_pose(data)),
        REP_VD_CONTROLLER_STATE => ReplyBody::VirtualControllerState(get_controller_state(data)),
        REP_VD_ADD => ReplyBody::AddVirtualDevice {
            virtual_id: data.get_u32_le(),
        },
        REP_DM_INFO => ReplyBody::DeviceInfo(DeviceInfo {
            device_id: data.get_u32_le(),
            device_class: get_device_class(data),
            mode: get_device_mode(data)?,
            offsets_enabled: get_bool(data),
            button_mapping_enabled: get_bool(data),
            redirect_suspended: get_bool(data),
            step_detection_enabled: get_bool(data),
            partner_id: data.get_u32_le(),
        }),
        REP_DM_OFFSETS => ReplyBody::DeviceOffsets {
            device_id: data.get_u32_le(),
            offsets_enabled: get_bool(data),
            offsets: get_offsets(data),
        },
        other => return Err(ManipError::UnknownMessage(other)),
    };

    Ok(Reply {
        message_id,
        status,
        body,
    })
}
