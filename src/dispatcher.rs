//! Request dispatcher: one named thread draining the inbound queue.

use crate::channel::{QueueNamespace, QueueReceiver, QueueSender};
use crate::engine::Engine;
use crate::protocol::{
    self, Reply, ReplyBody, Request, RequestBody, RequestHeader, Status, PROTOCOL_VERSION,
    QUEUE_CAPACITY,
};
use crate::{ManipError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Inbound queue name used when the host does not pick one.
pub const DEFAULT_QUEUE_NAME: &str = "devmanip.dispatcher";

/// How long one receive waits before the stop flag is checked again.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(50);

/// Connected clients and their reply queues.
pub struct ClientManager {
    clients: HashMap<u32, QueueSender>,
    next_id: u32,
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register a reply queue under a fresh id. Ids count up from 1; once
    /// they wrap, ids still held by a connected client are skipped.
    pub fn register(&mut self, reply: QueueSender) -> u32 {
        let mut id = self.next_id;
        while self.clients.contains_key(&id) {
            id = next_client_id(id);
        }
        self.next_id = next_client_id(id);
        self.clients.insert(id, reply);
        id
    }

    pub fn get(&self, id: u32) -> Option<&QueueSender> {
        self.clients.get(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<QueueSender> {
        self.clients.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn next_client_id(id: u32) -> u32 {
    id.wrapping_add(1).max(1)
}

/// Turns decoded requests into engine calls and replies.
pub struct RequestHandler {
    engine: Arc<Engine>,
    namespace: Arc<QueueNamespace>,
    clients: ClientManager,
}

impl RequestHandler {
    pub fn new(engine: Arc<Engine>, namespace: Arc<QueueNamespace>) -> Self {
        Self {
            engine,
            namespace,
            clients: ClientManager::new(),
        }
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    /// Handle one request and deliver its reply.
    pub fn handle(&mut self, request: Request) {
        let header = request.header;
        match &request.body {
            RequestBody::ClientConnect {
                protocol_version,
                reply_queue,
            } => self.connect(&header, *protocol_version, reply_queue),
            RequestBody::ClientDisconnect => self.disconnect(&header),
            body => {
                let result = self.execute(&header, body);
                if let Err(e) = &result {
                    log::debug!(
                        "Request {} from client {} failed: {}",
                        body.type_code(),
                        header.client_id,
                        e
                    );
                }
                let Some(endpoint) = self.clients.get(header.client_id).cloned() else {
                    log::warn!(
                        "Dropping request {} from unknown client {}",
                        body.type_code(),
                        header.client_id
                    );
                    return;
                };
                let reply = make_reply(header.message_id, body, result);
                self.deliver(header.client_id, &endpoint, reply);
            }
        }
    }

    /// Run a request against the engine. Connection management is handled by [`Self::handle`].
    pub fn execute(&self, header: &RequestHeader, body: &RequestBody) -> Result<ReplyBody> {
        if !self.clients.contains(header.client_id) {
            return Err(ManipError::NotFound(header.client_id));
        }
        let engine = &self.engine;
        let reply = match body {
            RequestBody::ClientConnect { .. } | RequestBody::ClientDisconnect => {
                return Err(ManipError::InvalidOperation(body.type_code()));
            }
            RequestBody::Ping { nonce } => ReplyBody::Ping { nonce: *nonce },

            RequestBody::ButtonEvents(events) => {
                engine.inject_button_events(events);
                ReplyBody::Generic
            }
            RequestBody::AxisEvents(events) => {
                engine.inject_axis_events(events);
                ReplyBody::Generic
            }
            RequestBody::PoseUpdate { device_id, pose } => {
                engine.inject_pose(*device_id, pose, header.timestamp);
                ReplyBody::Generic
            }

            RequestBody::GetVirtualDeviceCount => {
                ReplyBody::VirtualDeviceCount(engine.virtual_device_count())
            }
            RequestBody::GetVirtualDeviceInfo { virtual_id } => {
                ReplyBody::VirtualDeviceInfo(engine.virtual_device_info(*virtual_id)?)
            }
            RequestBody::GetVirtualDevicePose { virtual_id } => {
                ReplyBody::VirtualDevicePose(engine.virtual_device_pose(*virtual_id)?)
            }
            RequestBody::GetVirtualControllerState { virtual_id } => {
                ReplyBody::VirtualControllerState(engine.virtual_controller_state(*virtual_id)?)
            }
            RequestBody::AddVirtualDevice {
                device_type,
                serial,
            } => ReplyBody::AddVirtualDevice {
                virtual_id: engine.add_virtual_device(*device_type, serial)?,
            },
            RequestBody::PublishVirtualDevice { virtual_id } => {
                engine.publish_virtual_device(*virtual_id)?;
                ReplyBody::Generic
            }
            RequestBody::SetVirtualDeviceProperty {
                virtual_id,
                property,
                value,
            } => {
                engine.set_virtual_device_property(*virtual_id, *property, value.clone())?;
                ReplyBody::Generic
            }
            RequestBody::RemoveVirtualDeviceProperty {
                virtual_id,
                property,
            } => {
                engine.remove_virtual_device_property(*virtual_id, *property)?;
                ReplyBody::Generic
            }
            RequestBody::SetVirtualDevicePose { virtual_id, pose } => {
                engine.set_virtual_device_pose(*virtual_id, *pose, header.timestamp)?;
                ReplyBody::Generic
            }
            RequestBody::SetVirtualControllerState { virtual_id, state } => {
                engine.set_virtual_controller_state(*virtual_id, *state, header.timestamp)?;
                ReplyBody::Generic
            }

            RequestBody::GetDeviceInfo { device_id } => {
                ReplyBody::DeviceInfo(engine.device_info(*device_id)?)
            }
            RequestBody::GetDeviceOffsets { device_id } => {
                let (offsets_enabled, offsets) = engine.device_offsets(*device_id)?;
                ReplyBody::DeviceOffsets {
                    device_id: *device_id,
                    offsets_enabled,
                    offsets,
                }
            }
            RequestBody::SetDeviceOffsets {
                device_id,
                operation,
                enable,
                update,
            } => {
                engine.set_device_offsets(*device_id, *operation, *enable, update)?;
                ReplyBody::Generic
            }
            RequestBody::DefaultMode { device_id } => {
                engine.set_default_mode(*device_id)?;
                ReplyBody::Generic
            }
            RequestBody::FakeDisconnectedMode { device_id } => {
                engine.set_fake_disconnected(*device_id)?;
                ReplyBody::Generic
            }
            RequestBody::RedirectMode {
                device_id,
                target_id,
            } => {
                engine.set_redirect(*device_id, *target_id)?;
                ReplyBody::Generic
            }
            RequestBody::SwapMode {
                device_id,
                target_id,
            } => {
                engine.set_swap(*device_id, *target_id)?;
                ReplyBody::Generic
            }
            RequestBody::MotionCompensationMode {
                device_id,
                vel_acc_mode,
            } => {
                engine.set_motion_compensation(*device_id, *vel_acc_mode)?;
                ReplyBody::Generic
            }
            RequestBody::SetMotionCompensationProperties { vel_acc_mode } => {
                engine.set_motion_compensation_properties(*vel_acc_mode)?;
                ReplyBody::Generic
            }
            RequestBody::StepDetection(request) => {
                engine.step_detection(request)?;
                ReplyBody::Generic
            }
            RequestBody::ButtonMapping {
                device_id,
                enable,
                operation,
                values,
            } => {
                engine.button_mapping(*device_id, *enable, *operation, values)?;
                ReplyBody::Generic
            }
            RequestBody::TriggerHapticPulse {
                device_id,
                axis_id,
                duration_micros,
                direct,
            } => {
                engine.trigger_haptic_pulse(*device_id, *axis_id, *duration_micros, *direct)?;
                ReplyBody::Generic
            }
        };
        Ok(reply)
    }

    fn connect(&mut self, header: &RequestHeader, version: u32, reply_queue: &str) {
        let endpoint = match self.namespace.open(reply_queue) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::warn!("Client connect failed: {}", e);
                return;
            }
        };
        let body = RequestBody::ClientConnect {
            protocol_version: version,
            reply_queue: reply_queue.to_string(),
        };
        let result = if version == PROTOCOL_VERSION {
            let client_id = self.clients.register(endpoint.clone());
            log::info!("Client {} connected (reply queue \"{}\")", client_id, reply_queue);
            Ok(ReplyBody::ClientConnect {
                client_id,
                protocol_version: PROTOCOL_VERSION,
            })
        } else {
            log::warn!(
                "Rejected client on \"{}\": protocol version {} (ours {})",
                reply_queue,
                version,
                PROTOCOL_VERSION
            );
            Err(ManipError::InvalidVersion {
                ours: PROTOCOL_VERSION,
                theirs: version,
            })
        };
        // The client needs its id even when it asked for no reply.
        let reply = make_reply(header.message_id, &body, result);
        if let Err(e) = send_reply(&endpoint, &reply) {
            log::warn!("Could not deliver connect reply to \"{}\": {}", reply_queue, e);
        }
    }

    fn disconnect(&mut self, header: &RequestHeader) {
        let Some(endpoint) = self.clients.remove(header.client_id) else {
            log::warn!(
                "Disconnect from unknown client {}: {}",
                header.client_id,
                ManipError::NotFound(header.client_id)
            );
            return;
        };
        log::info!("Client {} disconnected", header.client_id);
        if header.message_id != 0 {
            let reply = Reply {
                message_id: header.message_id,
                status: Status::Ok,
                body: ReplyBody::Generic,
            };
            if let Err(e) = send_reply(&endpoint, &reply) {
                log::debug!("Disconnect reply to client {} not delivered: {}", header.client_id, e);
            }
        }
    }

    /// Best-effort reply. A closed queue means the client is gone.
    fn deliver(&mut self, client_id: u32, endpoint: &QueueSender, reply: Reply) {
        if reply.message_id == 0 {
            return;
        }
        match send_reply(endpoint, &reply) {
            Ok(()) => {}
            Err(ManipError::ChannelClosed) => {
                log::warn!("Reply queue of client {} closed, removing client", client_id);
                self.clients.remove(client_id);
            }
            Err(e) => log::warn!("Reply to client {} dropped: {}", client_id, e),
        }
    }
}

fn make_reply(message_id: u64, body: &RequestBody, result: Result<ReplyBody>) -> Reply {
    match result {
        Ok(reply_body) => Reply {
            message_id,
            status: Status::Ok,
            body: reply_body,
        },
        Err(e) => Reply {
            message_id,
            status: e.status(),
            body: body.error_body(&e),
        },
    }
}

fn send_reply(endpoint: &QueueSender, reply: &Reply) -> Result<()> {
    let frame = protocol::encode_reply(reply)?;
    endpoint.send(frame)
}

/// Handle to the running dispatcher thread.
pub struct Dispatcher {
    queue_name: String,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Create the inbound queue `queue_name` in `namespace` and start serving it.
    pub fn start(
        engine: Arc<Engine>,
        namespace: Arc<QueueNamespace>,
        queue_name: &str,
    ) -> Result<Dispatcher> {
        let receiver = namespace.create(queue_name, QUEUE_CAPACITY);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let handler = RequestHandler::new(engine, namespace.clone());

        let thread = std::thread::Builder::new()
            .name("devmanip-dispatcher".into())
            .spawn(move || {
                dispatcher_loop(handler, namespace, receiver, stop_clone);
            })
            .map_err(|e| ManipError::Io(format!("Failed to spawn dispatcher thread: {}", e)))?;

        Ok(Dispatcher {
            queue_name: queue_name.to_string(),
            stop_flag,
            thread: Some(thread),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn is_running(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed)
    }

    /// Stop the loop and wait for the thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatcher_loop(
    mut handler: RequestHandler,
    namespace: Arc<QueueNamespace>,
    receiver: QueueReceiver,
    stop_flag: Arc<AtomicBool>,
) {
    log::info!("Dispatcher started on \"{}\"", receiver.name());

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            log::info!("Dispatcher stopping (stop flag set)");
            break;
        }

        let frame = match receiver.recv_timeout(RECEIVE_TIMEOUT) {
            Ok(frame) => frame,
            Err(ManipError::Timeout) => continue,
            Err(e) => {
                log::warn!("Dispatcher queue failed: {}", e);
                break;
            }
        };

        match protocol::decode_request(&frame) {
            Ok(request) => handler.handle(request),
            Err(e) => log::warn!("Ignoring inbound message: {}", e),
        }
    }

    if !namespace.remove_owned(&receiver) {
        log::debug!("Queue \"{}\" was re-created, leaving it registered", receiver.name());
    }
}
