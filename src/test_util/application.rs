use bytes::BufMut;
use tracing::warn;

use crate::application::{MessageContext, NetworkApplication};
use crate::connection::{ConnectionRecord, PeerId};
use crate::control_messages::{DestinationCode, LeaveReason};
use crate::engine::{Engine, Reliability};
use crate::error::EndReason;
use crate::routing::Destination;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AppEvent {
    Connected,
    ClientConnected(PeerId),
    ClientTimedOut(PeerId),
    ClientDisconnected(PeerId, LeaveReason),
    Closed(EndReason),
    Message {
        sender: PeerId,
        message_type: u16,
        body: Vec<u8>,
    },
}

/// A [NetworkApplication] that records every callback in order
#[derive(Debug, Default)]
pub struct RecordingApplication {
    pub events: Vec<AppEvent>,
    /// Consume at most this many bytes of each message body, simulating a parser that gets
    ///  out of step with the sender. The full body is recorded regardless.
    pub consume_at_most: Option<usize>,
    /// If set, every received application message of another type is answered with a reliable
    ///  message of this type and body, addressed to `REPLY`
    pub reply_with: Option<(u16, Vec<u8>)>,
}

impl RecordingApplication {
    pub fn new() -> RecordingApplication {
        RecordingApplication::default()
    }

    /// (sender, message type, body) of all received application messages
    pub fn messages(&self) -> Vec<(PeerId, u16, Vec<u8>)> {
        self.events.iter()
            .filter_map(|e| match e {
                AppEvent::Message { sender, message_type, body } => Some((*sender, *message_type, body.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn take_events(&mut self) -> Vec<AppEvent> {
        std::mem::take(&mut self.events)
    }
}

impl NetworkApplication for RecordingApplication {
    fn on_network_connected(&mut self, _engine: &mut Engine) {
        self.events.push(AppEvent::Connected);
    }

    fn on_network_client_connected(&mut self, _engine: &mut Engine, peer: PeerId) {
        self.events.push(AppEvent::ClientConnected(peer));
    }

    fn on_network_client_timed_out(&mut self, _engine: &mut Engine, peer: PeerId, _record: &ConnectionRecord) {
        self.events.push(AppEvent::ClientTimedOut(peer));
    }

    fn on_network_client_disconnected(&mut self, _engine: &mut Engine, peer: PeerId, _record: &ConnectionRecord, reason: LeaveReason) {
        self.events.push(AppEvent::ClientDisconnected(peer, reason));
    }

    fn on_network_closed(&mut self, _engine: &mut Engine, reason: EndReason) {
        self.events.push(AppEvent::Closed(reason));
    }

    fn parse_application_message(&mut self, engine: &mut Engine, ctx: &MessageContext, body: &mut &[u8]) -> bool {
        self.events.push(AppEvent::Message {
            sender: ctx.sender,
            message_type: ctx.header.message_type,
            body: body.to_vec(),
        });

        let consumed = match self.consume_at_most {
            Some(n) => n.min(body.len()),
            None => body.len(),
        };
        *body = &body[consumed..];

        if let Some((reply_type, reply_body)) = &self.reply_with {
            if *reply_type != ctx.header.message_type {
                let result = engine.send_message(Destination::Code(DestinationCode::Reply), *reply_type, Reliability::Reliable, |buf| buf.put_slice(reply_body));
                if let Err(e) = result {
                    warn!("error replying to {:?}: {}", ctx.sender, e);
                }
            }
        }
        true
    }
}
