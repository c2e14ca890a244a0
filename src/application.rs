use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::connection::{ConnectionRecord, PeerId};
use crate::control_messages::LeaveReason;
use crate::engine::Engine;
use crate::error::EndReason;
use crate::message_header::{is_application_message_type, MessageFooter, MessageHeader};

/// Where an application message came from
#[derive(Debug, Clone, Copy)]
pub struct MessageContext {
    pub sender_addr: SocketAddr,
    pub sender: PeerId,
    pub header: MessageHeader,
    pub footer: MessageFooter,
}

/// The host application's side of the engine. Callbacks get the engine so they can send
///  messages in response.
///
/// Lifecycle callbacks default to doing nothing.
pub trait NetworkApplication {
    /// client: the server confirmed the JOIN
    fn on_network_connected(&mut self, _engine: &mut Engine) {}

    /// server: a new peer joined
    fn on_network_client_connected(&mut self, _engine: &mut Engine, _peer: PeerId) {}

    /// server: a peer was force-disconnected because it did not send anything for too long.
    ///  The peer is already removed from the engine when this is called.
    fn on_network_client_timed_out(&mut self, _engine: &mut Engine, _peer: PeerId, _record: &ConnectionRecord) {}

    /// server: a peer left gracefully, or it was kicked
    fn on_network_client_disconnected(&mut self, _engine: &mut Engine, _peer: PeerId, _record: &ConnectionRecord, _reason: LeaveReason) {}

    /// the engine ended; this is the last callback for an engine
    fn on_network_closed(&mut self, _engine: &mut Engine, _reason: EndReason) {}

    /// Called for every application message (i.e. with a type starting at
    ///  [crate::message_header::APPLICATION_MESSAGE_TYPE_START]) directed at this node. `body`
    ///  is positioned at the start of the message body, and the handler is expected to consume
    ///  exactly the body. Returns `false` if the message could not be handled.
    ///
    /// The engine continues with the next message at the declared end of this message, no
    ///  matter how much of the body was consumed.
    fn parse_application_message(&mut self, engine: &mut Engine, ctx: &MessageContext, body: &mut &[u8]) -> bool;
}

pub type MessageHandler = Box<dyn FnMut(&mut Engine, &MessageContext, &mut &[u8]) -> anyhow::Result<()>>;

/// A [NetworkApplication] that dispatches application messages to handlers registered per
///  message type. Applications that need lifecycle callbacks embed a router and delegate to
///  [ApplicationRouter::dispatch].
#[derive(Default)]
pub struct ApplicationRouter {
    handlers: FxHashMap<u16, MessageHandler>,
}

impl ApplicationRouter {
    pub fn new() -> ApplicationRouter {
        ApplicationRouter::default()
    }

    pub fn register<F>(&mut self, message_type: u16, handler: F) -> anyhow::Result<()>
    where F: FnMut(&mut Engine, &MessageContext, &mut &[u8]) -> anyhow::Result<()> + 'static
    {
        if !is_application_message_type(message_type) {
            bail!("message type 0x{:04x} is reserved for the protocol", message_type);
        }

        match self.handlers.entry(message_type) {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second handler for message type 0x{:04x}", message_type))
            }
            Entry::Vacant(e) => {
                e.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    pub fn deregister(&mut self, message_type: u16) -> anyhow::Result<()> {
        if self.handlers.remove(&message_type).is_none() {
            return Err(anyhow!("deregistering a handler that was not previously registered: 0x{:04x}", message_type));
        }
        Ok(())
    }

    pub fn is_registered(&self, message_type: u16) -> bool {
        self.handlers.contains_key(&message_type)
    }

    pub fn dispatch(&mut self, engine: &mut Engine, ctx: &MessageContext, body: &mut &[u8]) -> bool {
        let message_type = ctx.header.message_type;
        let Some(handler) = self.handlers.get_mut(&message_type) else {
            debug!("no handler for application message type 0x{:04x} - skipping", message_type);
            return false;
        };

        match handler(engine, ctx, body) {
            Ok(()) => true,
            Err(e) => {
                warn!("error handling message of type 0x{:04x} from {:?}: {}", message_type, ctx.sender_addr, e);
                false
            }
        }
    }
}

impl NetworkApplication for ApplicationRouter {
    fn parse_application_message(&mut self, engine: &mut Engine, ctx: &MessageContext, body: &mut &[u8]) -> bool {
        self.dispatch(engine, ctx, body)
    }
}
