//! Typed client-side events.
//!
//! An event binds a channel name to a Rust value type. Plain [`Event`]s
//! carry the latest received value and forward sends straight to the
//! registry's send listener. [`InterpolatedEvent`]s add the netcode on top:
//! per-channel sequence ids, client-side prediction for streams this peer
//! originates, spring interpolation for streams it only observes, and
//! rollback when the server rejects a predicted value.

use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::interpolation::{tick_rate_stiffness, Interpolatable, Interpolator};
use shared::Packet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Installed by the registry; routes serialised packets into the send pool.
pub type SendListener = Arc<dyn Fn(Packet) + Send + Sync>;

/// Channel-erased interface the registry dispatches inbound packets through.
pub trait ClientEvent: Send {
    fn set_channel(&mut self, channel: &str);
    fn set_send_listener(&mut self, listener: SendListener);
    fn receive_event(&mut self, packet: &Packet);
}

/// How an interpolated channel treats its locally rendered value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionMode {
    /// The stream originates here: sends overwrite the rendered value
    /// immediately and stay until the server rejects one.
    AssumeAccepted,
    /// The stream is only observed: the rendered value springs toward the
    /// latest broadcast.
    Interpolate,
}

/// A plain typed channel without sequencing or interpolation.
pub struct Event<T> {
    channel: String,
    latest_value: Option<T>,
    on_receive: Option<Box<dyn FnMut(&T) + Send>>,
    send_listener: Option<SendListener>,
}

impl<T> Event<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    pub fn new() -> Self {
        Self {
            channel: String::new(),
            latest_value: None,
            on_receive: None,
            send_listener: None,
        }
    }

    pub fn with_callback(callback: impl FnMut(&T) + Send + 'static) -> Self {
        let mut event = Self::new();
        event.on_receive = Some(Box::new(callback));
        event
    }

    /// Serialises the value and hands it to the send listener, unsequenced.
    pub fn send(&mut self, value: &T) {
        let content = match serde_json::to_value(value) {
            Ok(content) => content,
            Err(err) => {
                error!("could not serialise value for {}: {}", self.channel, err);
                return;
            }
        };

        self.emit(Packet::new(self.channel.clone(), content));
    }

    pub fn on_event_received(&mut self, callback: impl FnMut(&T) + Send + 'static) {
        self.on_receive = Some(Box::new(callback));
    }

    pub fn latest_value(&self) -> Option<T> {
        self.latest_value.clone()
    }

    fn emit(&self, packet: Packet) {
        match &self.send_listener {
            Some(listener) => listener(packet),
            None => warn!("event {} has no send listener; packet dropped", self.channel),
        }
    }
}

impl<T> Default for Event<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ClientEvent for Event<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    fn set_channel(&mut self, channel: &str) {
        self.channel = channel.to_string();
    }

    fn set_send_listener(&mut self, listener: SendListener) {
        self.send_listener = Some(listener);
    }

    fn receive_event(&mut self, packet: &Packet) {
        let value: T = match serde_json::from_value(packet.content.clone()) {
            Ok(value) => value,
            Err(err) => {
                warn!("dropping undecodable packet on {}: {}", packet.channel, err);
                return;
            }
        };

        self.latest_value = Some(value.clone());

        if let Some(callback) = &mut self.on_receive {
            callback(&value);
        }
    }
}

/// An interpolated channel for continuous values.
pub struct InterpolatedEvent<T: Interpolatable> {
    channel: String,
    mode: PredictionMode,
    interpolator: Interpolator<T>,
    latest_value: T,
    current_value: T,
    /// Sequence ids sent but not yet seen echoed back, oldest first.
    expected_packets: VecDeque<i32>,
    last_event_id: i32,
    last_event_received: Option<Instant>,
    on_receive: Option<Box<dyn FnMut(&T) + Send>>,
    send_listener: Option<SendListener>,
}

impl<T> InterpolatedEvent<T>
where
    T: Interpolatable + Serialize + DeserializeOwned + Send,
{
    /// Tick rate the spring is tuned for until a `!ping` reports the real one.
    const DEFAULT_TICK_RATE: f32 = 5.0;

    /// A locally-originated stream with prediction enabled.
    pub fn new(initial_value: T) -> Self {
        Self::with_mode(PredictionMode::AssumeAccepted, initial_value)
    }

    pub fn with_mode(mode: PredictionMode, initial_value: T) -> Self {
        let mut interpolator = Interpolator::new(initial_value);
        interpolator.set_stiffness(tick_rate_stiffness(Self::DEFAULT_TICK_RATE));

        Self {
            channel: String::new(),
            mode,
            interpolator,
            latest_value: initial_value,
            current_value: initial_value,
            expected_packets: VecDeque::new(),
            last_event_id: 0,
            last_event_received: None,
            on_receive: None,
            send_listener: None,
        }
    }

    /// Serialises the value, stamps it with the next sequence id, and hands
    /// it to the send listener. In [`PredictionMode::AssumeAccepted`] the
    /// rendered value is updated immediately.
    pub fn send(&mut self, value: &T) {
        let content = match serde_json::to_value(value) {
            Ok(content) => content,
            Err(err) => {
                error!("could not serialise value for {}: {}", self.channel, err);
                return;
            }
        };

        let packet_id = self.next_event_id();
        self.expected_packets.push_back(packet_id);

        if self.mode == PredictionMode::AssumeAccepted {
            self.current_value = *value;
        }

        let packet = Packet::with_id(self.channel.clone(), content, packet_id);
        match &self.send_listener {
            Some(listener) => listener(packet),
            None => warn!("event {} has no send listener; packet dropped", self.channel),
        }
    }

    /// The value the application should render right now.
    pub fn get_current_value(&mut self) -> T {
        if self.mode == PredictionMode::Interpolate {
            self.current_value = self.interpolator.update();
        }
        self.current_value
    }

    pub fn latest_value(&self) -> T {
        self.latest_value
    }

    pub fn last_event_id(&self) -> i32 {
        self.last_event_id
    }

    pub fn last_event_received(&self) -> Option<Instant> {
        self.last_event_received
    }

    pub fn on_event_received(&mut self, callback: impl FnMut(&T) + Send + 'static) {
        self.on_receive = Some(Box::new(callback));
    }

    /// Ids wrap back to 1 past `i32::MAX`; 0 is reserved for unsequenced
    /// packets and is never produced.
    fn next_event_id(&mut self) -> i32 {
        if self.last_event_id >= i32::MAX {
            self.last_event_id = 0;
        }
        self.last_event_id += 1;
        self.last_event_id
    }

    /// Decides whether an inbound packet confirms our expectations.
    ///
    /// A negative id is a server reject. An id above anything we ever issued
    /// is another peer's event observed on the same channel, so pending
    /// expectations are flushed and the observation accepted. Otherwise the
    /// echo acknowledges every in-flight id below it.
    fn accept_event(&mut self, packet: &Packet) -> bool {
        if packet.packet_id < 0 {
            return false;
        }

        if packet.packet_id > self.last_event_id {
            self.expected_packets.clear();
        }

        while matches!(self.expected_packets.front(), Some(&front) if front < packet.packet_id) {
            self.expected_packets.pop_front();
        }

        true
    }
}

impl<T> ClientEvent for InterpolatedEvent<T>
where
    T: Interpolatable + Serialize + DeserializeOwned + Send,
{
    fn set_channel(&mut self, channel: &str) {
        self.channel = channel.to_string();
    }

    fn set_send_listener(&mut self, listener: SendListener) {
        self.send_listener = Some(listener);
    }

    fn receive_event(&mut self, packet: &Packet) {
        let value: T = match serde_json::from_value(packet.content.clone()) {
            Ok(value) => value,
            Err(err) => {
                warn!("dropping undecodable packet on {}: {}", packet.channel, err);
                return;
            }
        };

        self.latest_value = value;
        self.interpolator.update_target(value);

        if !self.accept_event(packet) {
            // Rejected: snap back to the authoritative value, undoing any
            // optimistic prediction.
            self.current_value = value;
        }

        self.last_event_received = Some(Instant::now());

        if let Some(callback) = &mut self.on_receive {
            callback(&value);
        }
    }
}
