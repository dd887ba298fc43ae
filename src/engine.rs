//! The device manipulation engine.
//!
//! [`Engine`] owns every piece of shared state: the device registry (with the
//! motion-compensation reference), the virtual device table and the step
//! classifier. The dispatcher calls the request handlers below; the host feeds
//! raw events through the pipeline entry points in `pipeline.rs`.

use crate::config::Settings;
use crate::error::HostError;
use crate::protocol::StepDetectionRequest;
use crate::registry::{DeviceActivation, DeviceRegistry};
use crate::step::{
    StepDetector, STEP_OP_ENABLE, STEP_OP_HMD_THRESHOLD, STEP_OP_JOG_THRESHOLD,
    STEP_OP_RUN_THRESHOLD, STEP_OP_WINDOW,
};
use crate::types::{
    AxisState, ButtonEventType, ControllerState, DeviceClass, DeviceId, DeviceInfo,
    DeviceOffsets, OffsetUpdate, Pose, Toggle,
};
use crate::virtual_device::{
    ControllerEvent, PropertyValue, PublishOutcome, VirtualDeviceInfo, VirtualDeviceTable,
};
use crate::{pipeline, ManipError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Receiver of everything the engine forwards to the tracking runtime.
///
/// Implementations are called from the host's callback thread and from the
/// dispatcher thread, without any engine lock held.
pub trait HostSink: Send + Sync {
    fn pose_updated(&self, device_id: u32, pose: &Pose) -> std::result::Result<(), HostError>;

    fn button_event(
        &self,
        device_id: u32,
        kind: ButtonEventType,
        button: u32,
        time_offset: f64,
    ) -> std::result::Result<(), HostError>;

    fn axis_updated(
        &self,
        device_id: u32,
        axis: u32,
        state: AxisState,
    ) -> std::result::Result<(), HostError>;

    fn haptic_pulse(
        &self,
        device_id: u32,
        axis: u32,
        duration_micros: u16,
    ) -> std::result::Result<(), HostError>;

    /// Ask the runtime to add a new device; it later shows up through
    /// [`Engine::device_activated`] with the same serial.
    fn publish_virtual_device(
        &self,
        serial: &str,
        class: DeviceClass,
    ) -> std::result::Result<(), HostError>;
}

pub struct Engine {
    pub(crate) devices: Mutex<DeviceRegistry>,
    pub(crate) virtual_devices: Mutex<VirtualDeviceTable>,
    pub(crate) steps: Mutex<StepDetector>,
    pub(crate) host: Arc<dyn HostSink>,
}

impl Engine {
    pub fn new(host: Arc<dyn HostSink>) -> Self {
        Self {
            devices: Mutex::new(DeviceRegistry::new()),
            virtual_devices: Mutex::new(VirtualDeviceTable::new()),
            steps: Mutex::new(StepDetector::default()),
            host,
        }
    }

    pub fn with_settings(host: Arc<dyn HostSink>, settings: &Settings) -> Result<Self> {
        let engine = Self::new(host);
        engine.apply_settings(settings)?;
        Ok(engine)
    }

    // -- Host lifecycle --

    /// A host device came up. Links a published virtual device with the same serial.
    pub fn device_activated(&self, activation: DeviceActivation) -> Result<DeviceId> {
        let serial = activation.serial.clone();
        let id = self.devices.lock().activate(activation)?;
        self.virtual_devices.lock().link_host(&serial, id);
        Ok(id)
    }

    pub fn device_deactivated(&self, raw: u32) -> Result<()> {
        let id = DeviceId::new(raw)?;
        self.devices
            .lock()
            .deactivate(id)
            .ok_or(ManipError::NotFound(raw))?;
        self.virtual_devices.lock().unlink_host(id);
        Ok(())
    }

    // -- Settings --

    /// Apply the process-wide parts of `settings`. Profiles are applied per device by clients.
    pub fn apply_settings(&self, settings: &Settings) -> Result<()> {
        settings.step_detection.check()?;
        let mut devices = self.devices.lock();
        devices.set_vel_acc_mode(u32::from(settings.vel_acc_compensation_mode))?;
        devices.set_step_detection_enabled(settings.step_detection_enabled);
        let mut steps = self.steps.lock();
        steps.set_config(settings.step_detection)?;
        steps.set_enabled(settings.step_detection_enabled);
        log::info!(
            "Applied settings (vel/acc {:?}, step detection {})",
            settings.vel_acc_compensation_mode,
            settings.step_detection_enabled
        );
        Ok(())
    }

    /// Current process-wide settings, without profiles.
    pub fn current_settings(&self) -> Settings {
        let devices = self.devices.lock();
        let steps = self.steps.lock();
        Settings {
            vel_acc_compensation_mode: devices.vel_acc_mode(),
            step_detection_enabled: devices.step_detection_enabled(),
            step_detection: *steps.config(),
            profiles: Vec::new(),
        }
    }

    // -- Device manipulation --

    pub fn device_info(&self, raw: u32) -> Result<DeviceInfo> {
        self.devices.lock().info(raw)
    }

    pub fn device_offsets(&self, raw: u32) -> Result<(bool, DeviceOffsets)> {
        self.devices.lock().offsets(raw)
    }

    pub fn set_device_offsets(
        &self,
        raw: u32,
        operation: u32,
        enable: Toggle,
        update: &OffsetUpdate,
    ) -> Result<()> {
        self.devices
            .lock()
            .set_offsets(raw, operation, enable, update)
    }

    pub fn set_default_mode(&self, raw: u32) -> Result<()> {
        self.devices.lock().set_default_mode(raw)
    }

    pub fn set_fake_disconnected(&self, raw: u32) -> Result<()> {
        self.devices.lock().set_fake_disconnected(raw)
    }

    pub fn set_redirect(&self, raw: u32, target_raw: u32) -> Result<()> {
        self.devices.lock().set_redirect(raw, target_raw)
    }

    pub fn set_swap(&self, raw: u32, target_raw: u32) -> Result<()> {
        self.devices.lock().set_swap(raw, target_raw)
    }

    pub fn set_motion_compensation(&self, raw: u32, vel_acc_mode: u32) -> Result<()> {
        self.devices
            .lock()
            .set_motion_compensation(raw, vel_acc_mode)
    }

    pub fn set_motion_compensation_properties(&self, vel_acc_mode: u32) -> Result<()> {
        self.devices.lock().set_vel_acc_mode(vel_acc_mode)
    }

    /// Global step-detection control.
    ///
    /// Operations: 1 enable/disable, 2 window seconds, 3 HMD threshold,
    /// 4 jog threshold, 5 run threshold.
    pub fn step_detection(&self, request: &StepDetectionRequest) -> Result<()> {
        match request.operation {
            STEP_OP_ENABLE => {
                let mut devices = self.devices.lock();
                devices.set_step_detection_enabled(request.enable);
                self.steps.lock().set_enabled(request.enable);
                log::info!("Step detection {}", if request.enable { "enabled" } else { "disabled" });
            }
            STEP_OP_WINDOW => self.steps.lock().set_window(request.value)?,
            STEP_OP_HMD_THRESHOLD => self.steps.lock().set_hmd_threshold(request.hmd_threshold)?,
            STEP_OP_JOG_THRESHOLD => self.steps.lock().set_jog_threshold(request.value)?,
            STEP_OP_RUN_THRESHOLD => self.steps.lock().set_run_threshold(request.value)?,
            other => return Err(ManipError::InvalidOperation(other)),
        }
        Ok(())
    }

    pub fn button_mapping(
        &self,
        raw: u32,
        enable: Toggle,
        operation: u32,
        values: &[u32],
    ) -> Result<()> {
        self.devices
            .lock()
            .apply_button_mapping(raw, enable, operation, values)
    }

    /// Client-requested haptic pulse. `direct` bypasses redirect/swap routing.
    pub fn trigger_haptic_pulse(
        &self,
        raw: u32,
        axis: u32,
        duration_micros: u16,
        direct: bool,
    ) -> Result<()> {
        let capable = self.devices.lock().lookup(raw)?.haptic_capable();
        if !capable {
            return Err(ManipError::InvalidType);
        }
        if direct {
            pipeline::forward(
                "haptic pulse",
                self.host.haptic_pulse(raw, axis, duration_micros),
            );
        } else {
            self.haptic_pulse(raw, axis, duration_micros);
        }
        Ok(())
    }

    // -- Virtual devices --

    pub fn virtual_device_count(&self) -> u32 {
        self.virtual_devices.lock().count()
    }

    pub fn virtual_device_info(&self, virtual_id: u32) -> Result<VirtualDeviceInfo> {
        self.virtual_devices
            .lock()
            .get(virtual_id)
            .map(|device| device.info())
    }

    pub fn add_virtual_device(&self, device_type: u32, serial: &str) -> Result<u32> {
        self.virtual_devices.lock().add(device_type, serial)
    }

    pub fn set_virtual_device_property(
        &self,
        virtual_id: u32,
        property: u32,
        value: Option<PropertyValue>,
    ) -> Result<()> {
        self.virtual_devices
            .lock()
            .set_property(virtual_id, property, value)
    }

    pub fn remove_virtual_device_property(&self, virtual_id: u32, property: u32) -> Result<()> {
        self.virtual_devices
            .lock()
            .remove_property(virtual_id, property)
    }

    /// Publish a virtual device to the host. Publishing twice is fine.
    pub fn publish_virtual_device(&self, virtual_id: u32) -> Result<()> {
        let outcome = self.virtual_devices.lock().publish(virtual_id)?;
        let PublishOutcome::Published { serial, class } = outcome else {
            return Ok(());
        };
        // The host may activate the new device from inside this call.
        if let Err(e) = self.host.publish_virtual_device(&serial, class) {
            log::warn!("Host refused virtual device \"{}\": {}", serial, e);
            self.virtual_devices.lock().revoke_publish(virtual_id);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn virtual_device_pose(&self, virtual_id: u32) -> Result<Pose> {
        self.virtual_devices
            .lock()
            .get(virtual_id)
            .map(|device| *device.pose())
    }

    /// Store a client pose (stamped at `timestamp` ms) and feed it to the pipeline when linked.
    pub fn set_virtual_device_pose(
        &self,
        virtual_id: u32,
        mut pose: Pose,
        timestamp: i64,
    ) -> Result<()> {
        pose.time_offset -= pipeline::latency_seconds(timestamp, pipeline::now_millis());
        let host_id = self.virtual_devices.lock().set_pose(virtual_id, pose)?;
        if let Some(host_id) = host_id {
            self.pose_updated(host_id.raw(), &pose);
        }
        Ok(())
    }

    pub fn virtual_controller_state(&self, virtual_id: u32) -> Result<ControllerState> {
        self.virtual_devices.lock().controller_state(virtual_id)
    }

    pub fn set_virtual_controller_state(
        &self,
        virtual_id: u32,
        state: ControllerState,
        timestamp: i64,
    ) -> Result<()> {
        let time_offset = -pipeline::latency_seconds(timestamp, pipeline::now_millis());
        let events = self
            .virtual_devices
            .lock()
            .set_controller_state(virtual_id, state, time_offset)?;
        for event in events {
            match event {
                ControllerEvent::Button(e) => {
                    self.button_event(e.device_id, e.kind, e.button, e.time_offset)
                }
                ControllerEvent::Axis(e) => self.axis_updated(e.device_id, e.axis, e.state),
            }
        }
        Ok(())
    }
}
