//! Client network runtime: UDP receive loop, handshake, and ping scheduling.

use crate::error::ClientError;
use crate::event::{ClientEvent, Event, SendListener};
use crate::pool::EventPool;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use shared::{unix_timestamp_ms, Packet, CONNECT_CHANNEL, MAX_DATAGRAM_SIZE, PING_CHANNEL};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV6, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Interval between outbound `!ping` packets.
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Delivered to [`Client::on_ping_update`] listeners after every `!ping`
/// response.
#[derive(Debug, Clone, Copy)]
pub struct PingUpdate {
    pub server_tick_rate: f32,
    pub ping_ms: u64,
}

#[derive(Default)]
struct ConnectionState {
    connection_id: Option<u32>,
    ping_ms: u64,
    server_tick_rate: f32,
}

struct ClientShared {
    socket: UdpSocket,
    server_addr: SocketAddr,
    events: Mutex<HashMap<String, Arc<Mutex<dyn ClientEvent>>>>,
    pool: EventPool,
    state: Mutex<ConnectionState>,
    ping_listeners: Mutex<Vec<Box<dyn Fn(&PingUpdate) + Send + Sync>>>,
    artificial_delay: Mutex<Option<Duration>>,
}

/// UDP client runtime.
///
/// Cheap to clone; all clones share the same socket, event registry, and
/// send pool. Typical use registers events up front, spawns [`start`] on a
/// task, and drives sends through the typed event handles.
///
/// [`start`]: Client::start
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Binds a dual-stack UDP socket and wires the send pool to it.
    ///
    /// Must be called inside a tokio runtime. No traffic is exchanged until
    /// [`start`](Client::start).
    pub async fn new(server_address: &str, server_port: u16) -> Result<Self, ClientError> {
        let server_addr = resolve_address(server_address, server_port)?;
        let socket = UdpSocket::bind("[::]:0").await?;

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Packet>();

        let shared = Arc::new(ClientShared {
            socket,
            server_addr,
            events: Mutex::new(HashMap::new()),
            pool: EventPool::new(),
            state: Mutex::new(ConnectionState::default()),
            ping_listeners: Mutex::new(Vec::new()),
            artificial_delay: Mutex::new(None),
        });

        // Pool flushes land on a queue drained by a sender task, so pooling
        // never blocks on the socket.
        shared.pool.add_listener(move |packet: &Packet| {
            let _ = send_tx.send(packet.clone());
        });

        let sender = shared.clone();
        tokio::spawn(async move {
            while let Some(packet) = send_rx.recv().await {
                let data = packet.to_wire();
                if let Err(err) = sender.socket.send_to(data.as_bytes(), sender.server_addr).await {
                    error!("failed to send {} packet: {}", packet.channel, err);
                }
            }
        });

        Ok(Self { shared })
    }

    /// Delays processing of every received datagram, simulating latency.
    pub fn set_artificial_delay(&self, delay: Duration) {
        *self.shared.artificial_delay.lock().unwrap() = Some(delay);
    }

    /// Registers a typed event and returns the shared handle the application
    /// uses to send values and read current state.
    pub fn add_event<E>(&self, channel: &str, mut event: E) -> Result<Arc<Mutex<E>>, ClientError>
    where
        E: ClientEvent + 'static,
    {
        let mut events = self.shared.events.lock().unwrap();
        if events.contains_key(channel) {
            return Err(ClientError::DuplicateChannel(channel.to_string()));
        }

        event.set_channel(channel);

        let pool = self.shared.pool.clone();
        let listener: SendListener = Arc::new(move |packet| pool.pool(packet));
        event.set_send_listener(listener);

        let handle = Arc::new(Mutex::new(event));
        let erased: Arc<Mutex<dyn ClientEvent>> = handle.clone();
        events.insert(channel.to_string(), erased);

        Ok(handle)
    }

    /// Registers a raw JSON channel with a receive callback.
    pub fn add_json_event(
        &self,
        channel: &str,
        callback: impl FnMut(&Value) + Send + 'static,
    ) -> Result<Arc<Mutex<Event<Value>>>, ClientError> {
        self.add_event(channel, Event::with_callback(callback))
    }

    /// Pools a raw packet for a channel, bypassing the typed registry.
    pub fn send(&self, channel: &str, content: Value) {
        self.shared.pool.pool(Packet::new(channel, content));
    }

    pub fn on_ping_update(&self, callback: impl Fn(&PingUpdate) + Send + Sync + 'static) {
        self.shared.ping_listeners.lock().unwrap().push(Box::new(callback));
    }

    /// Round-trip time measured by the last `!ping` exchange, in ms.
    pub fn get_ping(&self) -> u64 {
        self.shared.state.lock().unwrap().ping_ms
    }

    /// Tick rate the server reported on the last `!ping` exchange.
    pub fn get_tick_rate(&self) -> f32 {
        self.shared.state.lock().unwrap().server_tick_rate
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.shared.state.lock().unwrap().connection_id
    }

    /// Connects and runs the receive loop; resolves only on socket failure.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.send_internal(CONNECT_CHANNEL, Value::Null).await?;

        let pinger = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PING_INTERVAL).await;
                send_ping(&pinger).await;
            }
        });

        info!("client started, connecting to {}", self.shared.server_addr);

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _sender) = self.shared.socket.recv_from(&mut buffer).await?;

            let message = match std::str::from_utf8(&buffer[..len]) {
                Ok(message) => message.to_string(),
                Err(_) => {
                    warn!("dropping non-UTF-8 datagram");
                    continue;
                }
            };

            let delay = *self.shared.artificial_delay.lock().unwrap();
            match delay {
                Some(delay) => {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        process_datagram(&shared, &message);
                    });
                }
                None => process_datagram(&self.shared, &message),
            }
        }
    }

    /// Sends directly, skipping the pool. Internal handshake traffic only.
    async fn send_internal(&self, channel: &str, content: Value) -> Result<(), ClientError> {
        let data = Packet::new(channel, content).to_wire();
        self.shared
            .socket
            .send_to(data.as_bytes(), self.shared.server_addr)
            .await?;
        Ok(())
    }
}

fn process_datagram(shared: &Arc<ClientShared>, message: &str) {
    let packet = match Packet::parse(message) {
        Ok(packet) => packet,
        Err(err) => {
            warn!("dropping malformed datagram: {}", err);
            return;
        }
    };

    if packet.is_internal() {
        handle_internal(shared, &packet);
        return;
    }

    let handler = {
        let events = shared.events.lock().unwrap();
        events.get(&packet.channel).cloned()
    };

    match handler {
        Some(handler) => handler.lock().unwrap().receive_event(&packet),
        None => warn!("no event found for channel {}", packet.channel),
    }
}

/// Internal channels are handled synchronously in the receive path, never
/// queued or pooled.
fn handle_internal(shared: &Arc<ClientShared>, packet: &Packet) {
    match packet.channel.as_str() {
        CONNECT_CHANNEL => {
            let Some(id) = packet.content.get("connection_id").and_then(Value::as_u64) else {
                warn!("connect response without connection_id");
                return;
            };
            shared.state.lock().unwrap().connection_id = Some(id as u32);
            info!("connected with connection id {}", id);
        }
        PING_CHANNEL => {
            let timestamp = packet
                .content
                .get("client_timestamp")
                .and_then(Value::as_str)
                .and_then(|ts| ts.parse::<u64>().ok());
            let tick_rate = packet
                .content
                .get("server_tick_rate")
                .and_then(Value::as_f64)
                .map(|rate| rate as f32);

            let (Some(timestamp), Some(tick_rate)) = (timestamp, tick_rate) else {
                warn!("malformed ping response: {}", packet.content);
                return;
            };

            let ping_ms = unix_timestamp_ms().saturating_sub(timestamp);

            // Hold pooled values for roughly ten server ticks.
            if tick_rate > 0.0 {
                let pool_timeout = Duration::from_millis((2000.0 / tick_rate) as u64);
                shared.pool.set_timeout(pool_timeout);
            }

            {
                let mut state = shared.state.lock().unwrap();
                state.ping_ms = ping_ms;
                state.server_tick_rate = tick_rate;
            }

            let update = PingUpdate {
                server_tick_rate: tick_rate,
                ping_ms,
            };
            let listeners = shared.ping_listeners.lock().unwrap();
            for listener in listeners.iter() {
                listener(&update);
            }

            debug!("ping {} ms, server tick rate {}", ping_ms, tick_rate);
        }
        other => warn!("no internal event found for channel {}", other),
    }
}

async fn send_ping(shared: &Arc<ClientShared>) {
    let connection_id = shared.state.lock().unwrap().connection_id;
    let Some(connection_id) = connection_id else {
        warn!("ping skipped: no connection");
        return;
    };

    let content = json!({
        "connection_id": connection_id,
        "client_timestamp": unix_timestamp_ms().to_string(),
    });

    let data = Packet::new(PING_CHANNEL, content).to_wire();
    if let Err(err) = shared.socket.send_to(data.as_bytes(), shared.server_addr).await {
        error!("failed to send ping: {}", err);
    }
}

/// Resolves an address literal or host name to a socket address, normalised
/// to the IPv6 family so it can be reached from the dual-stack client socket.
fn resolve_address(server_address: &str, server_port: u16) -> Result<SocketAddr, ClientError> {
    if let Ok(ip) = server_address.parse::<IpAddr>() {
        return Ok(to_ipv6(SocketAddr::new(ip, server_port)));
    }

    let spec = format!("{}:{}", server_address, server_port);
    let addrs: Vec<SocketAddr> = spec
        .to_socket_addrs()
        .map_err(|_| ClientError::AddressResolution(spec.clone()))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv6())
        .or_else(|| addrs.first())
        .copied()
        .map(to_ipv6)
        .ok_or(ClientError::AddressResolution(spec))
}

fn to_ipv6(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(_) => addr,
        SocketAddr::V4(v4) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InterpolatedEvent;
    use shared::Vec2;

    #[tokio::test]
    async fn resolve_prefers_ipv6() {
        let addr = resolve_address("::1", 3000).unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 3000);
    }

    #[tokio::test]
    async fn resolve_maps_ipv4_literals() {
        let addr = resolve_address("127.0.0.1", 8080).unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 8080);
    }

    #[tokio::test]
    async fn resolve_rejects_garbage() {
        assert!(resolve_address("not an address", 1).is_err());
    }

    #[tokio::test]
    async fn duplicate_channel_registration_is_an_error() {
        let client = Client::new("::1", 3999).await.unwrap();

        client
            .add_event("move", InterpolatedEvent::new(Vec2::default()))
            .unwrap();
        let second = client.add_event("move", InterpolatedEvent::new(Vec2::default()));

        assert!(matches!(second, Err(ClientError::DuplicateChannel(_))));
    }

    #[tokio::test]
    async fn registered_events_receive_inbound_packets() {
        let client = Client::new("::1", 3999).await.unwrap();
        let handle = client
            .add_event("move", InterpolatedEvent::new(Vec2::default()))
            .unwrap();

        let packet = Packet::with_id("move", serde_json::json!({"x": 2.0, "y": 3.0}), 5);
        process_datagram(&client.shared, &packet.to_wire());

        assert_eq!(handle.lock().unwrap().latest_value(), Vec2::new(2.0, 3.0));
    }

    #[tokio::test]
    async fn connect_response_stores_the_connection_id() {
        let client = Client::new("::1", 3999).await.unwrap();
        assert_eq!(client.connection_id(), None);

        let packet = Packet::new(CONNECT_CHANNEL, serde_json::json!({"connection_id": 1}));
        process_datagram(&client.shared, &packet.to_wire());

        assert_eq!(client.connection_id(), Some(1));
    }

    #[tokio::test]
    async fn ping_response_updates_state_and_listeners() {
        let client = Client::new("::1", 3999).await.unwrap();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        client.on_ping_update(move |update: &PingUpdate| {
            sink.lock().unwrap().push(*update);
        });

        let sent_at = unix_timestamp_ms().saturating_sub(30);
        let packet = Packet::new(
            PING_CHANNEL,
            serde_json::json!({
                "client_timestamp": sent_at.to_string(),
                "server_tick_rate": 5.0,
            }),
        );
        process_datagram(&client.shared, &packet.to_wire());

        assert!(client.get_ping() >= 30);
        assert_eq!(client.get_tick_rate(), 5.0);

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].server_tick_rate, 5.0);
    }

    #[tokio::test]
    async fn unknown_channels_are_dropped_silently() {
        let client = Client::new("::1", 3999).await.unwrap();
        // Must not panic or disturb the registry.
        process_datagram(&client.shared, "mystery:1;{}");
        assert!(client.shared.events.lock().unwrap().is_empty());
    }
}
