//! # devmanip - tracked-device manipulation engine
//!
//! Sits between a motion-tracking runtime and its device drivers. Provides:
//! - Per-device offsets, button remapping, redirect/swap and fake disconnect
//! - Motion compensation against a reference device
//! - Walk-in-place step detection from HMD and controller velocities
//! - Client-created virtual controllers
//! - A fixed-frame request/reply protocol over named bounded queues
//! - C FFI for native host drivers
//!
//! ## Quick Start
//! ```no_run
//! use devmanip::{
//!     Client, DeviceActivation, DeviceClass, Dispatcher, Engine, HostSink, QueueNamespace,
//!     DEFAULT_QUEUE_NAME,
//! };
//! use std::sync::Arc;
//!
//! # fn run(host: Arc<dyn HostSink>) -> devmanip::Result<()> {
//! let engine = Arc::new(Engine::new(host));
//! engine.device_activated(DeviceActivation {
//!     id: 1,
//!     class: DeviceClass::Controller,
//!     serial: "LHR-0001".into(),
//!     haptic_capable: true,
//! })?;
//!
//! let namespace = QueueNamespace::shared();
//! let _dispatcher = Dispatcher::start(engine.clone(), namespace.clone(), DEFAULT_QUEUE_NAME)?;
//!
//! let client = Client::connect(namespace, DEFAULT_QUEUE_NAME)?;
//! client.fake_disconnected_mode(1)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod types;
pub mod protocol;
pub mod channel;
pub mod registry;
pub mod step;
pub mod virtual_device;
pub mod engine;
pub mod pipeline;
pub mod dispatcher;
pub mod client;
pub mod config;
pub mod ffi;

pub use channel::QueueNamespace;
pub use client::Client;
pub use config::{DeviceProfile, Settings};
pub use dispatcher::{Dispatcher, DEFAULT_QUEUE_NAME};
pub use engine::{Engine, HostSink};
pub use error::{HostError, ManipError};
pub use registry::DeviceActivation;
pub use step::StepConfig;
pub use types::*;
pub use virtual_device::{PropertyValue, VirtualDeviceInfo, VirtualDeviceType};

/// Result type alias for devmanip operations.
pub type Result<T> = std::result::Result<T, ManipError>;
