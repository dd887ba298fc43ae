use crate::types::{
    AxisEvent, ButtonEvent, ButtonEventType, ControllerState, DeviceClass, DeviceId, Pose,
    INVALID_DEVICE_INDEX, MAX_TRACKED_DEVICES,
};
use crate::{ManipError, Result};
use nalgebra::{Matrix3x4, Vector3};
use std::collections::HashMap;

// -- Well-known property ids --
pub const PROP_TRACKING_SYSTEM_NAME: u32 = 1000;
pub const PROP_MODEL_NUMBER: u32 = 1001;
pub const PROP_SERIAL_NUMBER: u32 = 1002;

/// Default table capacity.
pub const MAX_VIRTUAL_DEVICES: usize = MAX_TRACKED_DEVICES as usize;

/// Kinds of virtual device a client can create.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualDeviceType {
    TrackedController = 1,
}

impl VirtualDeviceType {
    pub fn from_raw(raw: u32) -> Result<VirtualDeviceType> {
        match raw {
            1 => Ok(VirtualDeviceType::TrackedController),
            _ => Err(ManipError::InvalidType),
        }
    }

    pub fn device_class(self) -> DeviceClass {
        match self {
            VirtualDeviceType::TrackedController => DeviceClass::Controller,
        }
    }
}

/// Typed value of a device property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Float(f32),
    Int32(i32),
    Uint64(u64),
    String(String),
    Vector3(Vector3<f64>),
    Matrix34(Matrix3x4<f64>),
}

/// Summary of a virtual device as reported to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualDeviceInfo {
    pub virtual_id: u32,
    /// Host device id, `INVALID_DEVICE_INDEX` until the host activates it.
    pub host_id: u32,
    pub device_type: u32,
    pub published: bool,
    pub serial: String,
}

/// Input change derived from a controller state update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControllerEvent {
    Button(ButtonEvent),
    Axis(AxisEvent),
}

/// Result of a publish request.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Newly published; the host should be told about it.
    Published { serial: String, class: DeviceClass },
    AlreadyPublished,
}

#[derive(Debug, Clone)]
pub struct VirtualDevice {
    virtual_id: u32,
    serial: String,
    device_type: VirtualDeviceType,
    properties: HashMap<u32, PropertyValue>,
    published: bool,
    host_id: Option<DeviceId>,
    pose: Pose,
    controller_state: ControllerState,
}

impl VirtualDevice {
    fn new(virtual_id: u32, device_type: VirtualDeviceType, serial: &str) -> Self {
        let mut properties = HashMap::new();
        properties.insert(PROP_SERIAL_NUMBER, PropertyValue::String(serial.to_string()));
        Self {
            virtual_id,
            serial: serial.to_string(),
            device_type,
            properties,
            published: false,
            host_id: None,
            pose: Pose {
                pose_is_valid: false,
                device_is_connected: false,
                ..Pose::default()
            },
            controller_state: ControllerState::default(),
        }
    }

    pub fn virtual_id(&self) -> u32 {
        self.virtual_id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn device_type(&self) -> VirtualDeviceType {
        self.device_type
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    pub fn host_id(&self) -> Option<DeviceId> {
        self.host_id
    }

    pub fn property(&self, property: u32) -> Option<&PropertyValue> {
        self.properties.get(&property)
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn controller_state(&self) -> &ControllerState {
        &self.controller_state
    }

    pub fn info(&self) -> VirtualDeviceInfo {
        VirtualDeviceInfo {
            virtual_id: self.virtual_id,
            host_id: self.host_id.map_or(INVALID_DEVICE_INDEX, DeviceId::raw),
            device_type: self.device_type as u32,
            published: self.published,
            serial: self.serial.clone(),
        }
    }
}

/// Button and axis changes between two controller states, in a stable order:
/// touches, presses, releases, untouches, then axes.
pub fn controller_state_diff(
    host_id: u32,
    old: &ControllerState,
    new: &ControllerState,
    time_offset: f64,
) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    let mut button = |kind: ButtonEventType, mask: u64| {
        for bit in 0..64u32 {
            if mask & (1u64 << bit) != 0 {
                events.push(ControllerEvent::Button(ButtonEvent {
                    device_id: host_id,
                    kind,
                    button: bit,
                    time_offset,
                }));
            }
        }
    };
    let touched = new.buttons_touched & !old.buttons_touched;
    let untouched = old.buttons_touched & !new.buttons_touched;
    let pressed = new.buttons_pressed & !old.buttons_pressed;
    let unpressed = old.buttons_pressed & !new.buttons_pressed;
    button(ButtonEventType::Touched, touched);
    button(ButtonEventType::Pressed, pressed);
    button(ButtonEventType::Unpressed, unpressed);
    button(ButtonEventType::Untouched, untouched);

    for (axis, (before, after)) in old.axes.iter().zip(new.axes.iter()).enumerate() {
        if before != after {
            events.push(ControllerEvent::Axis(AxisEvent {
                device_id: host_id,
                axis: axis as u32,
                state: *after,
            }));
        }
    }
    events
}

/// Client-created virtual devices. Slots are never reused.
pub struct VirtualDeviceTable {
    devices: Vec<VirtualDevice>,
    capacity: usize,
}

impl Default for VirtualDeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDeviceTable {
    pub fn new() -> Self {
        Self::with_capacity(MAX_VIRTUAL_DEVICES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            devices: Vec::new(),
            capacity: capacity.min(MAX_VIRTUAL_DEVICES),
        }
    }

    pub fn count(&self) -> u32 {
        self.devices.len() as u32
    }

    pub fn find_by_serial(&self, serial: &str) -> Option<&VirtualDevice> {
        self.devices.iter().find(|d| d.serial == serial)
    }

    pub fn get(&self, virtual_id: u32) -> Result<&VirtualDevice> {
        if virtual_id >= MAX_TRACKED_DEVICES {
            return Err(ManipError::InvalidId(virtual_id));
        }
        self.devices
            .get(virtual_id as usize)
            .ok_or(ManipError::NotFound(virtual_id))
    }

    fn get_mut(&mut self, virtual_id: u32) -> Result<&mut VirtualDevice> {
        if virtual_id >= MAX_TRACKED_DEVICES {
            return Err(ManipError::InvalidId(virtual_id));
        }
        self.devices
            .get_mut(virtual_id as usize)
            .ok_or(ManipError::NotFound(virtual_id))
    }

    /// Create a device. A duplicate serial reports the existing id.
    pub fn add(&mut self, device_type: u32, serial: &str) -> Result<u32> {
        let device_type = VirtualDeviceType::from_raw(device_type)?;
        if let Some(existing) = self.find_by_serial(serial) {
            return Err(ManipError::AlreadyInUse(existing.virtual_id));
        }
        if self.devices.len() >= self.capacity {
            return Err(ManipError::TooManyDevices);
        }
        let virtual_id = self.devices.len() as u32;
        self.devices
            .push(VirtualDevice::new(virtual_id, device_type, serial));
        log::info!("Added virtual device {} (serial \"{}\")", virtual_id, serial);
        Ok(virtual_id)
    }

    pub fn set_property(
        &mut self,
        virtual_id: u32,
        property: u32,
        value: Option<PropertyValue>,
    ) -> Result<()> {
        let device = self.get_mut(virtual_id)?;
        let value = value.ok_or(ManipError::InvalidType)?;
        log::trace!(
            "Virtual device {} property {} = {:?}",
            virtual_id,
            property,
            value
        );
        device.properties.insert(property, value);
        Ok(())
    }

    pub fn remove_property(&mut self, virtual_id: u32, property: u32) -> Result<()> {
        let device = self.get_mut(virtual_id)?;
        device.properties.remove(&property);
        Ok(())
    }

    /// Mark a device published once its identity properties are set.
    pub fn publish(&mut self, virtual_id: u32) -> Result<PublishOutcome> {
        let device = self.get_mut(virtual_id)?;
        if device.published {
            return Ok(PublishOutcome::AlreadyPublished);
        }
        if !device.properties.contains_key(&PROP_TRACKING_SYSTEM_NAME) {
            return Err(ManipError::MissingProperty("tracking system name"));
        }
        if !device.properties.contains_key(&PROP_MODEL_NUMBER) {
            return Err(ManipError::MissingProperty("model number"));
        }
        device.published = true;
        log::info!("Published virtual device {} (serial \"{}\")", virtual_id, device.serial);
        Ok(PublishOutcome::Published {
            serial: device.serial.clone(),
            class: device.device_type.device_class(),
        })
    }

    /// Undo a publish the host refused.
    pub(crate) fn revoke_publish(&mut self, virtual_id: u32) {
        if let Ok(device) = self.get_mut(virtual_id) {
            device.published = false;
        }
    }

    /// Bind a published device to the host id the host activated it under.
    pub fn link_host(&mut self, serial: &str, host_id: DeviceId) -> Option<u32> {
        let device = self
            .devices
            .iter_mut()
            .find(|d| d.published && d.serial == serial)?;
        device.host_id = Some(host_id);
        device.pose.device_is_connected = true;
        log::info!(
            "Virtual device {} is host device {}",
            device.virtual_id,
            host_id
        );
        Some(device.virtual_id)
    }

    pub fn unlink_host(&mut self, host_id: DeviceId) {
        for device in self.devices.iter_mut().filter(|d| d.host_id == Some(host_id)) {
            device.host_id = None;
            device.pose.device_is_connected = false;
        }
    }

    /// Store a pose. Returns the host id to forward it to, if linked.
    pub fn set_pose(&mut self, virtual_id: u32, pose: Pose) -> Result<Option<DeviceId>> {
        let device = self.get_mut(virtual_id)?;
        device.pose = pose;
        Ok(device.host_id)
    }

    pub fn controller_state(&self, virtual_id: u32) -> Result<ControllerState> {
        let device = self.get(virtual_id)?;
        match device.device_type {
            VirtualDeviceType::TrackedController => Ok(device.controller_state),
        }
    }

    /// Store a controller state and return the input changes to forward
    /// (empty while the device is not linked to a host id).
    pub fn set_controller_state(
        &mut self,
        virtual_id: u32,
        state: ControllerState,
        time_offset: f64,
    ) -> Result<Vec<ControllerEvent>> {
        let device = self.get_mut(virtual_id)?;
        match device.device_type {
            VirtualDeviceType::TrackedController => {}
        }
        let events = match device.host_id {
            Some(host_id) => {
                controller_state_diff(host_id.raw(), &device.controller_state, &state, time_offset)
            }
            None => Vec::new(),
        };
        device.controller_state = state;
        Ok(events)
    }
}
