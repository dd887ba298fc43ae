//! C FFI layer for devmanip.
//!
//! A native host driver creates one engine bound to its callbacks, reports
//! device activation and feeds raw events; forwarded events come back
//! through the callbacks. The generated C header is written to
//! `include/devmanip.h` by cbindgen.

use crate::channel::QueueNamespace;
use crate::config::Settings;
use crate::dispatcher::{Dispatcher, DEFAULT_QUEUE_NAME};
use crate::engine::{Engine, HostSink};
use crate::error::{HostError, LastError};
use crate::registry::DeviceActivation;
use crate::types::{AxisState, ButtonEventType, DeviceClass, Pose};
use crate::ManipError;
use nalgebra::{Quaternion, Vector3};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::Arc;

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque engine handle for C consumers.
pub struct DmEngine {
    engine: Arc<Engine>,
    _dispatcher: Dispatcher,
}

/// Pose in C-compatible layout. Quaternions are `[w, x, y, z]`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DmPose {
    /// Seconds relative to now; negative for samples from the past.
    pub time_offset: f64,
    pub world_from_driver_rotation: [f64; 4],
    pub world_from_driver_translation: [f64; 3],
    pub driver_from_head_rotation: [f64; 4],
    pub driver_from_head_translation: [f64; 3],
    /// Position in driver space, meters.
    pub position: [f64; 3],
    pub rotation: [f64; 4],
    pub velocity: [f64; 3],
    pub acceleration: [f64; 3],
    pub angular_velocity: [f64; 3],
    pub angular_acceleration: [f64; 3],
    pub pose_is_valid: bool,
    pub device_is_connected: bool,
}

fn quat_to_array(q: &Quaternion<f64>) -> [f64; 4] {
    [q.w, q.i, q.j, q.k]
}

fn quat_from_array(a: &[f64; 4]) -> Quaternion<f64> {
    Quaternion::new(a[0], a[1], a[2], a[3])
}

impl From<&Pose> for DmPose {
    fn from(pose: &Pose) -> Self {
        DmPose {
            time_offset: pose.time_offset,
            world_from_driver_rotation: quat_to_array(&pose.world_from_driver_rotation),
            world_from_driver_translation: pose.world_from_driver_translation.into(),
            driver_from_head_rotation: quat_to_array(&pose.driver_from_head_rotation),
            driver_from_head_translation: pose.driver_from_head_translation.into(),
            position: pose.position.into(),
            rotation: quat_to_array(&pose.rotation),
            velocity: pose.velocity.into(),
            acceleration: pose.acceleration.into(),
            angular_velocity: pose.angular_velocity.into(),
            angular_acceleration: pose.angular_acceleration.into(),
            pose_is_valid: pose.pose_is_valid,
            device_is_connected: pose.device_is_connected,
        }
    }
}

impl From<&DmPose> for Pose {
    fn from(pose: &DmPose) -> Self {
        Pose {
            time_offset: pose.time_offset,
            world_from_driver_rotation: quat_from_array(&pose.world_from_driver_rotation),
            world_from_driver_translation: Vector3::from(pose.world_from_driver_translation),
            driver_from_head_rotation: quat_from_array(&pose.driver_from_head_rotation),
            driver_from_head_translation: Vector3::from(pose.driver_from_head_translation),
            position: Vector3::from(pose.position),
            rotation: quat_from_array(&pose.rotation),
            velocity: Vector3::from(pose.velocity),
            acceleration: Vector3::from(pose.acceleration),
            angular_velocity: Vector3::from(pose.angular_velocity),
            angular_acceleration: Vector3::from(pose.angular_acceleration),
            pose_is_valid: pose.pose_is_valid,
            device_is_connected: pose.device_is_connected,
        }
    }
}

/// Host callbacks. Each returns 0 on success; a missing callback drops the event.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DmHostCallbacks {
    /// Passed back unchanged as the first argument of every callback.
    pub user_data: *mut c_void,
    pub pose_updated: Option<unsafe extern "C" fn(*mut c_void, u32, *const DmPose) -> c_int>,
    /// `(user_data, device_id, kind, button, time_offset)`; kind 0 pressed,
    /// 1 unpressed, 2 touched, 3 untouched.
    pub button_event: Option<unsafe extern "C" fn(*mut c_void, u32, u32, u32, f64) -> c_int>,
    pub axis_updated: Option<unsafe extern "C" fn(*mut c_void, u32, u32, f32, f32) -> c_int>,
    pub haptic_pulse: Option<unsafe extern "C" fn(*mut c_void, u32, u32, u16) -> c_int>,
    /// `(user_data, serial, device_class)`.
    pub publish_virtual_device:
        Option<unsafe extern "C" fn(*mut c_void, *const c_char, u32) -> c_int>,
}

struct CallbackHost(DmHostCallbacks);

// SAFETY: the host guarantees its callbacks and `user_data` may be used from
// any thread for the lifetime of the engine.
unsafe impl Send for CallbackHost {}
unsafe impl Sync for CallbackHost {}

fn check(name: &str, code: c_int) -> Result<(), HostError> {
    if code == 0 {
        Ok(())
    } else {
        Err(HostError(format!("{} callback returned {}", name, code)))
    }
}

impl HostSink for CallbackHost {
    fn pose_updated(&self, device_id: u32, pose: &Pose) -> Result<(), HostError> {
        let Some(callback) = self.0.pose_updated else {
            return Ok(());
        };
        let pose = DmPose::from(pose);
        check("pose", unsafe { callback(self.0.user_data, device_id, &pose) })
    }

    fn button_event(
        &self,
        device_id: u32,
        kind: ButtonEventType,
        button: u32,
        time_offset: f64,
    ) -> Result<(), HostError> {
        let Some(callback) = self.0.button_event else {
            return Ok(());
        };
        check("button", unsafe {
            callback(self.0.user_data, device_id, kind as u32, button, time_offset)
        })
    }

    fn axis_updated(&self, device_id: u32, axis: u32, state: AxisState) -> Result<(), HostError> {
        let Some(callback) = self.0.axis_updated else {
            return Ok(());
        };
        check("axis", unsafe {
            callback(self.0.user_data, device_id, axis, state.x, state.y)
        })
    }

    fn haptic_pulse(&self, device_id: u32, axis: u32, duration_micros: u16) -> Result<(), HostError> {
        let Some(callback) = self.0.haptic_pulse else {
            return Ok(());
        };
        check("haptic", unsafe {
            callback(self.0.user_data, device_id, axis, duration_micros)
        })
    }

    fn publish_virtual_device(&self, serial: &str, class: DeviceClass) -> Result<(), HostError> {
        let Some(callback) = self.0.publish_virtual_device else {
            return Err(HostError("host cannot add devices".into()));
        };
        let serial = CString::new(serial).map_err(|e| HostError(e.to_string()))?;
        check("publish", unsafe {
            callback(self.0.user_data, serial.as_ptr(), class as u32)
        })
    }
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<std::borrow::Cow<'a, str>> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy())
    }
}

fn status(result: crate::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Create an engine and start its dispatcher on `queue_name` (NULL for the
/// default name). Returns NULL on error (check `dm_last_error()`).
///
/// # Safety
/// `callbacks` must point to a valid `DmHostCallbacks`; `queue_name` must be
/// a valid C string or null.
#[no_mangle]
pub unsafe extern "C" fn dm_engine_create(
    callbacks: *const DmHostCallbacks,
    queue_name: *const c_char,
) -> *mut DmEngine {
    if callbacks.is_null() {
        LAST_ERROR.set(&ManipError::Unknown);
        return std::ptr::null_mut();
    }
    let host = Arc::new(CallbackHost(*callbacks));
    let engine = Arc::new(Engine::new(host));
    let queue_name = c_str(queue_name).unwrap_or(DEFAULT_QUEUE_NAME.into());

    match Dispatcher::start(engine.clone(), QueueNamespace::shared(), &queue_name) {
        Ok(dispatcher) => Box::into_raw(Box::new(DmEngine {
            engine,
            _dispatcher: dispatcher,
        })),
        Err(e) => {
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// Stop the dispatcher and free the engine.
///
/// # Safety
/// `engine` must be a pointer returned by `dm_engine_create`, or null.
#[no_mangle]
pub unsafe extern "C" fn dm_engine_destroy(engine: *mut DmEngine) {
    if !engine.is_null() {
        drop(Box::from_raw(engine));
    }
}

/// Load settings from a JSON file (missing file = defaults) and apply them.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `engine` must be a valid engine pointer; `path` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn dm_engine_load_settings(
    engine: *const DmEngine,
    path: *const c_char,
) -> c_int {
    let (Some(engine), Some(path)) = (engine.as_ref(), c_str(path)) else {
        return -1;
    };
    status(
        Settings::load_or_default(&*path)
            .and_then(|settings| engine.engine.apply_settings(&settings)),
    )
}

/// Report a device the host activated.
/// `device_class`: 1 HMD, 2 controller, 3 generic tracker, 4 tracking reference.
///
/// # Safety
/// `engine` must be a valid engine pointer; `serial` a valid C string or null.
#[no_mangle]
pub unsafe extern "C" fn dm_device_activated(
    engine: *const DmEngine,
    device_id: u32,
    device_class: u32,
    serial: *const c_char,
    haptic_capable: bool,
) -> c_int {
    let Some(engine) = engine.as_ref() else {
        return -1;
    };
    let activation = DeviceActivation {
        id: device_id,
        class: DeviceClass::from_raw(device_class),
        serial: c_str(serial).map(|s| s.into_owned()).unwrap_or_default(),
        haptic_capable,
    };
    status(engine.engine.device_activated(activation).map(|_| ()))
}

/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn dm_device_deactivated(engine: *const DmEngine, device_id: u32) -> c_int {
    let Some(engine) = engine.as_ref() else {
        return -1;
    };
    status(engine.engine.device_deactivated(device_id))
}

/// Feed a raw pose through the pipeline.
///
/// # Safety
/// `engine` and `pose` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn dm_pose_updated(
    engine: *const DmEngine,
    device_id: u32,
    pose: *const DmPose,
) -> c_int {
    let (Some(engine), Some(pose)) = (engine.as_ref(), pose.as_ref()) else {
        return -1;
    };
    engine.engine.pose_updated(device_id, &Pose::from(pose));
    0
}

/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn dm_button_event(
    engine: *const DmEngine,
    device_id: u32,
    kind: u32,
    button: u32,
    time_offset: f64,
) -> c_int {
    let Some(engine) = engine.as_ref() else {
        return -1;
    };
    let Some(kind) = ButtonEventType::from_raw(kind) else {
        LAST_ERROR.set(&ManipError::InvalidOperation(kind));
        return -1;
    };
    engine.engine.button_event(device_id, kind, button, time_offset);
    0
}

/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn dm_axis_updated(
    engine: *const DmEngine,
    device_id: u32,
    axis: u32,
    x: f32,
    y: f32,
) -> c_int {
    let Some(engine) = engine.as_ref() else {
        return -1;
    };
    engine
        .engine
        .axis_updated(device_id, axis, AxisState { x, y });
    0
}

/// Haptic request from the runtime, routed to the hardware playing `device_id`.
///
/// # Safety
/// `engine` must be a valid engine pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn dm_haptic_pulse(
    engine: *const DmEngine,
    device_id: u32,
    axis: u32,
    duration_micros: u16,
) -> c_int {
    let Some(engine) = engine.as_ref() else {
        return -1;
    };
    engine.engine.haptic_pulse(device_id, axis, duration_micros);
    0
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next devmanip API call.
#[no_mangle]
pub extern "C" fn dm_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    static SEEN: Mutex<Vec<(u32, [f64; 3])>> = parking_lot::const_mutex(Vec::new());

    unsafe extern "C" fn record_pose(_: *mut c_void, device_id: u32, pose: *const DmPose) -> c_int {
        SEEN.lock().push((device_id, (*pose).position));
        0
    }

    fn callbacks() -> DmHostCallbacks {
        DmHostCallbacks {
            user_data: std::ptr::null_mut(),
            pose_updated: Some(record_pose),
            button_event: None,
            axis_updated: None,
            haptic_pulse: None,
            publish_virtual_device: None,
        }
    }

    #[test]
    fn test_pose_conversion_keeps_quaternion_order() {
        let pose = Pose {
            rotation: Quaternion::new(0.5, 0.5, -0.5, 0.5),
            position: Vector3::new(1.0, 2.0, 3.0),
            ..Pose::default()
        };
        let c_pose = DmPose::from(&pose);
        assert_eq!(c_pose.rotation, [0.5, 0.5, -0.5, 0.5]);
        assert_eq!(Pose::from(&c_pose), pose);
    }

    #[test]
    fn test_engine_lifecycle() {
        let name = CString::new("devmanip.ffi-test").unwrap();
        let serial = CString::new("LHR-1").unwrap();
        unsafe {
            let engine = dm_engine_create(&callbacks(), name.as_ptr());
            assert!(!engine.is_null());
            assert!(QueueNamespace::shared().contains("devmanip.ffi-test"));

            assert_eq!(dm_device_activated(engine, 2, 2, serial.as_ptr(), true), 0);
            assert_eq!(dm_device_activated(engine, 99, 2, serial.as_ptr(), true), -1);
            assert!(!dm_last_error().is_null());
            assert_eq!(dm_button_event(engine, 2, 17, 1, 0.0), -1);

            let pose = DmPose::from(&Pose {
                position: Vector3::new(0.0, 1.0, 0.0),
                ..Pose::default()
            });
            assert_eq!(dm_pose_updated(engine, 2, &pose), 0);
            assert_eq!(dm_device_deactivated(engine, 2), 0);
            assert_eq!(dm_device_deactivated(engine, 2), -1);

            dm_engine_destroy(engine);
        }
        assert!(SEEN.lock().contains(&(2, [0.0, 1.0, 0.0])));
        assert!(!QueueNamespace::shared().contains("devmanip.ffi-test"));
    }
}
