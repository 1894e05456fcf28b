//! Ordered fan-out of server events to user callbacks.

use crate::config::ServerConfig;
use crate::error::PipeError;
use crate::event::ServerEvent;
use crate::handle::ClientHandle;
use bytes::Bytes;

/// Handler object reacting to server events.
///
/// Every method has an empty default body; implement only what you need.
/// Methods run on the loop thread and must not block indefinitely. They
/// may re-enter the server (`send_to`, `close`, `set_config`).
#[allow(unused_variables)]
pub trait ServerEventHandler: Send {
    fn on_connected(&mut self, client_id: usize, handle: &ClientHandle) {}
    fn on_disconnected(&mut self, client_id: usize, error: Option<&PipeError>) {}
    fn on_message(&mut self, client_id: usize, handle: &ClientHandle, payload: &Bytes) {}
    fn on_start(&mut self, config: &ServerConfig) {}
    fn on_stop(&mut self, config: &ServerConfig) {}
    fn on_error(&mut self, error: &PipeError) {}
}

type EventFn = Box<dyn FnMut(&ServerEvent) + Send>;
type ConnectedFn = Box<dyn FnMut(usize, &ClientHandle) + Send>;
type DisconnectedFn = Box<dyn FnMut(usize, Option<&PipeError>) + Send>;
type MessageFn = Box<dyn FnMut(usize, &ClientHandle, &Bytes) + Send>;
type ConfigFn = Box<dyn FnMut(&ServerConfig) + Send>;
type ErrorFn = Box<dyn FnMut(&PipeError) + Send>;

/// Registered callbacks for one server.
///
/// For each event the fan-out order is fixed: the installed handler's
/// typed method, then the matching typed callback, then the universal
/// sink.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    handler: Option<Box<dyn ServerEventHandler>>,
    on_connected: Option<ConnectedFn>,
    on_disconnected: Option<DisconnectedFn>,
    on_message: Option<MessageFn>,
    on_start: Option<ConfigFn>,
    on_stop: Option<ConfigFn>,
    on_error: Option<ErrorFn>,
    on_event: Option<EventFn>,
}

impl EventDispatcher {
    pub fn set_handler(&mut self, handler: Box<dyn ServerEventHandler>) {
        self.handler = Some(handler);
    }

    pub fn set_on_connected(&mut self, callback: ConnectedFn) {
        self.on_connected = Some(callback);
    }

    pub fn set_on_disconnected(&mut self, callback: DisconnectedFn) {
        self.on_disconnected = Some(callback);
    }

    pub fn set_on_message(&mut self, callback: MessageFn) {
        self.on_message = Some(callback);
    }

    pub fn set_on_start(&mut self, callback: ConfigFn) {
        self.on_start = Some(callback);
    }

    pub fn set_on_stop(&mut self, callback: ConfigFn) {
        self.on_stop = Some(callback);
    }

    pub fn set_on_error(&mut self, callback: ErrorFn) {
        self.on_error = Some(callback);
    }

    pub fn set_on_event(&mut self, callback: EventFn) {
        self.on_event = Some(callback);
    }

    pub fn emit(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::ServerStarted { config } => {
                if let Some(handler) = &mut self.handler {
                    handler.on_start(config);
                }
                if let Some(callback) = &mut self.on_start {
                    callback(config);
                }
            }
            ServerEvent::ServerStopped { config } => {
                if let Some(handler) = &mut self.handler {
                    handler.on_stop(config);
                }
                if let Some(callback) = &mut self.on_stop {
                    callback(config);
                }
            }
            ServerEvent::ClientConnected { client_id, handle } => {
                if let Some(handler) = &mut self.handler {
                    handler.on_connected(*client_id, handle);
                }
                if let Some(callback) = &mut self.on_connected {
                    callback(*client_id, handle);
                }
            }
            ServerEvent::ClientDisconnected {
                client_id, error, ..
            } => {
                if let Some(handler) = &mut self.handler {
                    handler.on_disconnected(*client_id, error.as_ref());
                }
                if let Some(callback) = &mut self.on_disconnected {
                    callback(*client_id, error.as_ref());
                }
            }
            ServerEvent::MessageReceived {
                client_id,
                handle,
                payload,
            } => {
                if let Some(handler) = &mut self.handler {
                    handler.on_message(*client_id, handle, payload);
                }
                if let Some(callback) = &mut self.on_message {
                    callback(*client_id, handle, payload);
                }
            }
            ServerEvent::ErrorOccurred { error } => {
                if let Some(handler) = &mut self.handler {
                    handler.on_error(error);
                }
                if let Some(callback) = &mut self.on_error {
                    callback(error);
                }
            }
        }
        if let Some(callback) = &mut self.on_event {
            callback(event);
        }
    }
}
