//! Client side of the request/reply protocol.
//!
//! A [`Client`] owns a reply queue in the namespace, sends requests to the
//! dispatcher's queue and matches replies by message id.
//!
//! ```no_run
//! use devmanip::{Client, QueueNamespace, DEFAULT_QUEUE_NAME};
//!
//! let client = Client::connect(QueueNamespace::shared(), DEFAULT_QUEUE_NAME).unwrap();
//! let info = client.device_info(0).unwrap();
//! println!("HMD mode: {:?}", info.mode);
//! ```

use crate::channel::{QueueNamespace, QueueReceiver, QueueSender};
use crate::config::DeviceProfile;
use crate::pipeline::now_millis;
use crate::protocol::{
    self, Reply, ReplyBody, Request, RequestBody, RequestHeader, Status, StepDetectionRequest,
    MAX_AXIS_EVENTS, MAX_BUTTON_EVENTS, MAX_BUTTON_MAPPING_VALUES, PROTOCOL_VERSION,
    QUEUE_CAPACITY,
};
use crate::step::{
    STEP_OP_ENABLE, STEP_OP_HMD_THRESHOLD, STEP_OP_JOG_THRESHOLD, STEP_OP_RUN_THRESHOLD,
    STEP_OP_WINDOW,
};
use crate::types::{
    AxisEvent, ButtonEvent, ControllerState, DeviceInfo, DeviceOffsets, OffsetOperation,
    OffsetUpdate, Pose, Toggle, VelAccMode,
};
use crate::virtual_device::{PropertyValue, VirtualDeviceInfo, VirtualDeviceType};
use crate::{ManipError, Result};
use nalgebra::Vector3;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a transaction waits for its reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

static REPLY_QUEUE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Connected protocol client.
pub struct Client {
    namespace: Arc<QueueNamespace>,
    server: QueueSender,
    replies: Mutex<QueueReceiver>,
    reply_queue: String,
    client_id: u32,
    next_message_id: AtomicU64,
    timeout: Duration,
    connected: bool,
}

impl Client {
    /// Connect to the dispatcher listening on `server_queue`.
    pub fn connect(namespace: Arc<QueueNamespace>, server_queue: &str) -> Result<Client> {
        Self::connect_with_version(namespace, server_queue, PROTOCOL_VERSION)
    }

    /// Connect announcing an explicit protocol version.
    pub fn connect_with_version(
        namespace: Arc<QueueNamespace>,
        server_queue: &str,
        protocol_version: u32,
    ) -> Result<Client> {
        let server = namespace.open(server_queue)?;
        let reply_queue = format!(
            "{}.client.{}.{}",
            server_queue,
            std::process::id(),
            REPLY_QUEUE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let replies = namespace.create(&reply_queue, QUEUE_CAPACITY);

        let mut client = Client {
            namespace,
            server,
            replies: Mutex::new(replies),
            reply_queue,
            client_id: 0,
            next_message_id: AtomicU64::new(1),
            timeout: DEFAULT_REPLY_TIMEOUT,
            connected: false,
        };

        let reply = client.transaction(RequestBody::ClientConnect {
            protocol_version,
            reply_queue: client.reply_queue.clone(),
        })?;
        match (reply.status, reply.body) {
            (
                Status::Ok,
                ReplyBody::ClientConnect {
                    client_id,
                    protocol_version: _,
                },
            ) => {
                client.client_id = client_id;
                client.connected = true;
                log::info!("Connected to \"{}\" as client {}", server_queue, client_id);
                Ok(client)
            }
            (
                Status::InvalidVersion,
                ReplyBody::ClientConnect {
                    protocol_version: theirs,
                    ..
                },
            ) => Err(ManipError::InvalidVersion {
                ours: protocol_version,
                theirs,
            }),
            (Status::Ok, body) => Err(unexpected(&body)),
            (status, _) => Err(ManipError::from_status(status, 0)),
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for the reply carrying the same message id.
    pub fn transaction(&self, body: RequestBody) -> Result<Reply> {
        let replies = self.replies.lock();
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        self.send(body, message_id)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ManipError::Timeout);
            }
            let frame = replies.recv_timeout(remaining)?;
            match protocol::decode_reply(&frame) {
                Ok(reply) if reply.message_id == message_id => return Ok(reply),
                Ok(reply) => log::debug!("Discarding stale reply {}", reply.message_id),
                Err(e) => log::warn!("Ignoring undecodable reply: {}", e),
            }
        }
    }

    /// Send a request that wants no reply.
    pub fn notify(&self, body: RequestBody) -> Result<()> {
        self.send(body, 0)
    }

    fn send(&self, body: RequestBody, message_id: u64) -> Result<()> {
        let frame = protocol::encode_request(&Request {
            header: RequestHeader {
                client_id: self.client_id,
                message_id,
                timestamp: now_millis(),
            },
            body,
        })?;
        self.server.send(frame)
    }

    /// Transaction that fails on a non-Ok status. `id` fills in id-carrying errors.
    fn request(&self, body: RequestBody, id: u32) -> Result<ReplyBody> {
        let reply = self.transaction(body)?;
        match reply.status {
            Status::Ok => Ok(reply.body),
            status => Err(ManipError::from_status(status, id)),
        }
    }

    fn request_generic(&self, body: RequestBody, id: u32) -> Result<()> {
        self.request(body, id).map(|_| ())
    }

    /// Leave the server and wait for the acknowledgement.
    pub fn disconnect(mut self) -> Result<()> {
        self.connected = false;
        self.request_generic(RequestBody::ClientDisconnect, self.client_id)
    }

    pub fn ping(&self, nonce: u64) -> Result<u64> {
        match self.request(RequestBody::Ping { nonce }, self.client_id)? {
            ReplyBody::Ping { nonce } => Ok(nonce),
            other => Err(unexpected(&other)),
        }
    }

    // -- Raw event injection (no reply) --

    pub fn send_button_events(&self, events: &[ButtonEvent]) -> Result<()> {
        for chunk in events.chunks(MAX_BUTTON_EVENTS) {
            self.notify(RequestBody::ButtonEvents(chunk.to_vec()))?;
        }
        Ok(())
    }

    pub fn send_axis_events(&self, events: &[AxisEvent]) -> Result<()> {
        for chunk in events.chunks(MAX_AXIS_EVENTS) {
            self.notify(RequestBody::AxisEvents(chunk.to_vec()))?;
        }
        Ok(())
    }

    pub fn send_pose_update(&self, device_id: u32, pose: &Pose) -> Result<()> {
        self.notify(RequestBody::PoseUpdate {
            device_id,
            pose: *pose,
        })
    }

    // -- Virtual devices --

    pub fn virtual_device_count(&self) -> Result<u32> {
        match self.request(RequestBody::GetVirtualDeviceCount, 0)? {
            ReplyBody::VirtualDeviceCount(count) => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    pub fn virtual_device_info(&self, virtual_id: u32) -> Result<VirtualDeviceInfo> {
        match self.request(RequestBody::GetVirtualDeviceInfo { virtual_id }, virtual_id)? {
            ReplyBody::VirtualDeviceInfo(info) => Ok(info),
            other => Err(unexpected(&other)),
        }
    }

    pub fn virtual_device_pose(&self, virtual_id: u32) -> Result<Pose> {
        match self.request(RequestBody::GetVirtualDevicePose { virtual_id }, virtual_id)? {
            ReplyBody::VirtualDevicePose(pose) => Ok(pose),
            other => Err(unexpected(&other)),
        }
    }

    pub fn virtual_controller_state(&self, virtual_id: u32) -> Result<ControllerState> {
        match self.request(
            RequestBody::GetVirtualControllerState { virtual_id },
            virtual_id,
        )? {
            ReplyBody::VirtualControllerState(state) => Ok(state),
            other => Err(unexpected(&other)),
        }
    }

    /// Create a virtual device. A taken serial fails with `AlreadyInUse(existing_id)`.
    pub fn add_virtual_device(&self, device_type: VirtualDeviceType, serial: &str) -> Result<u32> {
        let reply = self.transaction(RequestBody::AddVirtualDevice {
            device_type: device_type as u32,
            serial: serial.to_string(),
        })?;
        match (reply.status, reply.body) {
            (Status::Ok, ReplyBody::AddVirtualDevice { virtual_id }) => Ok(virtual_id),
            (Status::AlreadyInUse, ReplyBody::AddVirtualDevice { virtual_id }) => {
                Err(ManipError::AlreadyInUse(virtual_id))
            }
            (Status::Ok, other) => Err(unexpected(&other)),
            (status, _) => Err(ManipError::from_status(status, 0)),
        }
    }

    pub fn publish_virtual_device(&self, virtual_id: u32) -> Result<()> {
        self.request_generic(RequestBody::PublishVirtualDevice { virtual_id }, virtual_id)
    }

    pub fn set_virtual_device_property(
        &self,
        virtual_id: u32,
        property: u32,
        value: PropertyValue,
    ) -> Result<()> {
        self.request_generic(
            RequestBody::SetVirtualDeviceProperty {
                virtual_id,
                property,
                value: Some(value),
            },
            virtual_id,
        )
    }

    pub fn remove_virtual_device_property(&self, virtual_id: u32, property: u32) -> Result<()> {
        self.request_generic(
            RequestBody::RemoveVirtualDeviceProperty {
                virtual_id,
                property,
            },
            virtual_id,
        )
    }

    pub fn set_virtual_device_pose(&self, virtual_id: u32, pose: &Pose) -> Result<()> {
        self.request_generic(
            RequestBody::SetVirtualDevicePose {
                virtual_id,
                pose: *pose,
            },
            virtual_id,
        )
    }

    pub fn set_virtual_controller_state(
        &self,
        virtual_id: u32,
        state: &ControllerState,
    ) -> Result<()> {
        self.request_generic(
            RequestBody::SetVirtualControllerState {
                virtual_id,
                state: *state,
            },
            virtual_id,
        )
    }

    // -- Device manipulation --

    pub fn device_info(&self, device_id: u32) -> Result<DeviceInfo> {
        match self.request(RequestBody::GetDeviceInfo { device_id }, device_id)? {
            ReplyBody::DeviceInfo(info) => Ok(info),
            other => Err(unexpected(&other)),
        }
    }

    /// Stored offsets and whether they are applied.
    pub fn device_offsets(&self, device_id: u32) -> Result<(bool, DeviceOffsets)> {
        match self.request(RequestBody::GetDeviceOffsets { device_id }, device_id)? {
            ReplyBody::DeviceOffsets {
                offsets_enabled,
                offsets,
                ..
            } => Ok((offsets_enabled, offsets)),
            other => Err(unexpected(&other)),
        }
    }

    pub fn set_device_offsets(
        &self,
        device_id: u32,
        operation: OffsetOperation,
        enable: Toggle,
        update: &OffsetUpdate,
    ) -> Result<()> {
        self.request_generic(
            RequestBody::SetDeviceOffsets {
                device_id,
                operation: operation as u32,
                enable,
                update: *update,
            },
            device_id,
        )
    }

    /// Overwrite all offsets of `device_id` with `profile`.
    pub fn apply_profile(&self, device_id: u32, profile: &DeviceProfile) -> Result<()> {
        let (enable, update) = profile.to_update();
        log::debug!("Applying profile \"{}\" to device {}", profile.name, device_id);
        self.set_device_offsets(device_id, OffsetOperation::Set, enable, &update)
    }

    pub fn default_mode(&self, device_id: u32) -> Result<()> {
        self.request_generic(RequestBody::DefaultMode { device_id }, device_id)
    }

    pub fn fake_disconnected_mode(&self, device_id: u32) -> Result<()> {
        self.request_generic(RequestBody::FakeDisconnectedMode { device_id }, device_id)
    }

    pub fn redirect_mode(&self, device_id: u32, target_id: u32) -> Result<()> {
        self.request_generic(
            RequestBody::RedirectMode {
                device_id,
                target_id,
            },
            device_id,
        )
    }

    pub fn swap_mode(&self, device_id: u32, target_id: u32) -> Result<()> {
        self.request_generic(
            RequestBody::SwapMode {
                device_id,
                target_id,
            },
            device_id,
        )
    }

    pub fn motion_compensation_mode(
        &self,
        device_id: u32,
        vel_acc_mode: VelAccMode,
    ) -> Result<()> {
        self.request_generic(
            RequestBody::MotionCompensationMode {
                device_id,
                vel_acc_mode: vel_acc_mode.into(),
            },
            device_id,
        )
    }

    pub fn set_motion_compensation_properties(&self, vel_acc_mode: VelAccMode) -> Result<()> {
        self.request_generic(
            RequestBody::SetMotionCompensationProperties {
                vel_acc_mode: vel_acc_mode.into(),
            },
            0,
        )
    }

    fn step_detection(
        &self,
        operation: u32,
        enable: bool,
        value: f64,
        hmd: Vector3<f64>,
    ) -> Result<()> {
        self.request_generic(
            RequestBody::StepDetection(StepDetectionRequest {
                operation,
                enable,
                value,
                hmd_threshold: hmd,
            }),
            0,
        )
    }

    pub fn enable_step_detection(&self, enable: bool) -> Result<()> {
        self.step_detection(STEP_OP_ENABLE, enable, 0.0, Vector3::zeros())
    }

    pub fn set_step_window(&self, seconds: f64) -> Result<()> {
        self.step_detection(STEP_OP_WINDOW, false, seconds, Vector3::zeros())
    }

    pub fn set_step_hmd_threshold(&self, threshold: Vector3<f64>) -> Result<()> {
        self.step_detection(STEP_OP_HMD_THRESHOLD, false, 0.0, threshold)
    }

    pub fn set_step_jog_threshold(&self, threshold: f64) -> Result<()> {
        self.step_detection(STEP_OP_JOG_THRESHOLD, false, threshold, Vector3::zeros())
    }

    pub fn set_step_run_threshold(&self, threshold: f64) -> Result<()> {
        self.step_detection(STEP_OP_RUN_THRESHOLD, false, threshold, Vector3::zeros())
    }

    /// Raw button mapping request: 0 none, 1 add pairs, 2 erase sources, 3 erase all.
    pub fn button_mapping(
        &self,
        device_id: u32,
        enable: Toggle,
        operation: u32,
        values: &[u32],
    ) -> Result<()> {
        self.request_generic(
            RequestBody::ButtonMapping {
                device_id,
                enable,
                operation,
                values: values.to_vec(),
            },
            device_id,
        )
    }

    /// Add `source -> target` mappings, split over as many requests as needed.
    pub fn add_button_mappings(&self, device_id: u32, pairs: &[(u32, u32)]) -> Result<()> {
        for chunk in pairs.chunks(MAX_BUTTON_MAPPING_VALUES / 2) {
            let values: Vec<u32> = chunk.iter().flat_map(|&(s, t)| [s, t]).collect();
            self.button_mapping(device_id, Toggle::Unchanged, 1, &values)?;
        }
        Ok(())
    }

    pub fn trigger_haptic_pulse(
        &self,
        device_id: u32,
        axis_id: u32,
        duration_micros: u16,
        direct: bool,
    ) -> Result<()> {
        self.request_generic(
            RequestBody::TriggerHapticPulse {
                device_id,
                axis_id,
                duration_micros,
                direct,
            },
            device_id,
        )
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.connected {
            if let Err(e) = self.notify(RequestBody::ClientDisconnect) {
                log::debug!("Disconnect notification failed: {}", e);
            }
        }
        self.namespace.remove(&self.reply_queue);
    }
}

fn unexpected(body: &ReplyBody) -> ManipError {
    ManipError::MalformedFrame(format!("unexpected reply type {}", body.type_code()))
}
