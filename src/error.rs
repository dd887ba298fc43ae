use crate::protocol::Status;
use std::fmt;

/// Errors produced by the manipulation engine, the message channel and the client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManipError {
    #[error("Device id {0} is out of range")]
    InvalidId(u32),

    #[error("No active device or client with id {0}")]
    NotFound(u32),

    #[error("Operation not applicable to this device type")]
    InvalidType,

    #[error("Invalid operation code {0}")]
    InvalidOperation(u32),

    #[error("Virtual device table is full")]
    TooManyDevices,

    #[error("Serial already in use by virtual device {0}")]
    AlreadyInUse(u32),

    #[error("Mandatory property missing: {0}")]
    MissingProperty(&'static str),

    #[error("Protocol version mismatch (ours {ours}, theirs {theirs})")]
    InvalidVersion { ours: u32, theirs: u32 },

    #[error("Pairing rejected: {0}")]
    PairingRejected(&'static str),

    #[error("Request failed with unknown error")]
    Unknown,

    #[error("Message queue is full")]
    Overflow,

    #[error("Timeout waiting for message")]
    Timeout,

    #[error("Message queue closed")]
    ChannelClosed,

    #[error("No message queue named \"{0}\"")]
    QueueNotFound(String),

    #[error("Unknown message type {0}")]
    UnknownMessage(u32),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Host rejected forwarded event: {0}")]
    Host(#[from] HostError),

    #[error("Settings I/O failed: {0}")]
    Io(String),

    #[error("Settings parse failed: {0}")]
    Parse(String),
}

impl ManipError {
    /// Wire status reported to the client for this error.
    pub fn status(&self) -> Status {
        match self {
            ManipError::InvalidId(_) => Status::InvalidId,
            ManipError::NotFound(_) | ManipError::QueueNotFound(_) => Status::NotFound,
            ManipError::InvalidType => Status::InvalidType,
            ManipError::InvalidOperation(_) => Status::InvalidOperation,
            ManipError::TooManyDevices => Status::TooManyDevices,
            ManipError::AlreadyInUse(_) => Status::AlreadyInUse,
            ManipError::MissingProperty(_) => Status::MissingProperty,
            ManipError::InvalidVersion { .. } => Status::InvalidVersion,
            _ => Status::UnknownError,
        }
    }

    /// Rebuild an error from a non-Ok reply status on the client side.
    ///
    /// `id` is the device/virtual id the request addressed, used to fill in
    /// the variants that carry one.
    pub fn from_status(status: Status, id: u32) -> ManipError {
        match status {
            Status::InvalidId => ManipError::InvalidId(id),
            Status::NotFound => ManipError::NotFound(id),
            Status::InvalidType => ManipError::InvalidType,
            Status::InvalidOperation => ManipError::InvalidOperation(0),
            Status::TooManyDevices => ManipError::TooManyDevices,
            Status::AlreadyInUse => ManipError::AlreadyInUse(id),
            Status::MissingProperty => ManipError::MissingProperty("reported by server"),
            Status::InvalidVersion => ManipError::InvalidVersion {
                ours: crate::protocol::PROTOCOL_VERSION,
                theirs: 0,
            },
            Status::Ok | Status::UnknownError => ManipError::Unknown,
        }
    }
}

impl From<std::io::Error> for ManipError {
    fn from(err: std::io::Error) -> Self {
        ManipError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ManipError {
    fn from(err: serde_json::Error) -> Self {
        ManipError::Parse(err.to_string())
    }
}

/// Failure reported by the host when it refuses a forwarded event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: parking_lot::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: parking_lot::const_mutex(String::new()),
        }
    }

    pub fn set(&self, err: &ManipError) {
        *self.message.lock() = fmt::format(format_args!("{}\0", err));
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        let msg = self.message.lock();
        if msg.is_empty() {
            std::ptr::null()
        } else {
            msg.as_ptr() as *const std::ffi::c_char
        }
    }
}
