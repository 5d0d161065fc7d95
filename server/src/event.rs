//! Typed server-side events.
//!
//! A server event binds a channel to a handler that inspects the incoming
//! value and answers through a [`Responder`]: `accept` rebroadcasts under
//! the request's own id so clients can confirm their predictions, `reject`
//! rebroadcasts under the reject id so they roll back.

use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared::packet::REJECT_PACKET_ID;
use shared::Packet;
use std::marker::PhantomData;
use std::sync::Arc;

/// Injected by the runtime; fans a packet out to every known connection.
pub type BroadcastFn = Arc<dyn Fn(Packet) + Send + Sync>;

/// Channel-erased interface the event processor dispatches through.
pub trait ServerEvent: Send + Sync {
    fn set_broadcast_fn(&mut self, broadcast: BroadcastFn);
    fn receive_event(&self, packet: &Packet);
}

/// Accept/reject handle bound to one incoming packet.
///
/// A handler may call neither (swallow the event), or either; if it calls
/// both, every call broadcasts and the last broadcast received wins on the
/// clients.
pub struct Responder<T> {
    channel: String,
    packet_id: i32,
    broadcast: BroadcastFn,
    _value: PhantomData<T>,
}

impl<T: Serialize> Responder<T> {
    /// Broadcasts the value under the incoming packet's id.
    pub fn accept(&self, value: &T) {
        self.broadcast_with_id(value, self.packet_id);
    }

    /// Broadcasts the value under the reject id, telling the originator to
    /// roll its prediction back.
    pub fn reject(&self, value: &T) {
        self.broadcast_with_id(value, REJECT_PACKET_ID);
    }

    fn broadcast_with_id(&self, value: &T, packet_id: i32) {
        let content = match serde_json::to_value(value) {
            Ok(content) => content,
            Err(err) => {
                error!("could not serialise response for {}: {}", self.channel, err);
                return;
            }
        };
        (self.broadcast)(Packet::with_id(self.channel.clone(), content, packet_id));
    }
}

/// A typed channel handler.
///
/// Runs on the event processor's tick thread, so the handler must not
/// block; broadcasting through the [`Responder`] only queues outbound work.
pub struct Event<T> {
    handler: Box<dyn Fn(&T, &Responder<T>) + Send + Sync>,
    broadcast: Option<BroadcastFn>,
}

impl<T> Event<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(handler: impl Fn(&T, &Responder<T>) + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            broadcast: None,
        }
    }
}

/// `Event<Value>` passes the JSON document through untyped.
pub type JsonEvent = Event<Value>;

impl<T> ServerEvent for Event<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn set_broadcast_fn(&mut self, broadcast: BroadcastFn) {
        self.broadcast = Some(broadcast);
    }

    fn receive_event(&self, packet: &Packet) {
        let value: T = match serde_json::from_value(packet.content.clone()) {
            Ok(value) => value,
            Err(err) => {
                warn!("dropping undecodable packet on {}: {}", packet.channel, err);
                return;
            }
        };

        let Some(broadcast) = &self.broadcast else {
            warn!("event {} has no broadcast function; packet dropped", packet.channel);
            return;
        };

        let responder = Responder {
            channel: packet.channel.clone(),
            packet_id: packet.packet_id,
            broadcast: broadcast.clone(),
            _value: PhantomData,
        };

        (self.handler)(&value, &responder);
    }
}
