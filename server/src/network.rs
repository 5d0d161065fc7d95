//! Server network runtime: UDP receive loop, handshake dispatch, broadcast
//! fan-out, and the connection cleanup schedule.

use crate::connection_manager::ConnectionManager;
use crate::error::ServerError;
use crate::event::{BroadcastFn, ServerEvent};
use crate::processor::EventProcessor;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use shared::{Packet, CONNECT_CHANNEL, MAX_DATAGRAM_SIZE, PING_CHANNEL};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// How often expired connections are swept out.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(20);

/// Outbound work queued by handlers and the handshake path, drained by the
/// sender task that owns the socket sends.
enum OutboundMessage {
    Send { packet: Packet, addr: SocketAddr },
    Broadcast { packet: Packet },
}

struct ServerShared {
    socket: Arc<UdpSocket>,
    connections: Arc<tokio::sync::RwLock<ConnectionManager>>,
    events: Arc<RwLock<HashMap<String, Box<dyn ServerEvent>>>>,
    processor: EventProcessor,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,
    artificial_delay: Mutex<Option<Duration>>,
}

/// Authoritative UDP server runtime.
///
/// Cheap to clone; all clones share the socket, registry, connection map,
/// and event processor. Register events before [`start`], then run `start`
/// on a task or block on it.
///
/// [`start`]: Server::start
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Binds the dual-stack UDP socket. Pass port 0 to let the OS pick one
    /// (useful in tests; read it back with [`local_addr`](Server::local_addr)).
    pub async fn new(port: u16, connection_timeout: Duration) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(("::", port)).await?);

        let events: Arc<RwLock<HashMap<String, Box<dyn ServerEvent>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        // The tick worker resolves channels through the registry; packets
        // for unregistered channels are dropped here.
        let processor_events = events.clone();
        let processor = EventProcessor::new(move |packet: &Packet| {
            let registry = processor_events.read().unwrap();
            match registry.get(&packet.channel) {
                Some(event) => event.receive_event(packet),
                None => warn!("no event found for channel {}", packet.channel),
            }
        });

        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(ServerShared {
                socket,
                connections: Arc::new(tokio::sync::RwLock::new(ConnectionManager::new(
                    connection_timeout,
                ))),
                events,
                processor,
                out_tx,
                out_rx: Mutex::new(Some(out_rx)),
                artificial_delay: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Registers a typed event handler for a channel.
    pub fn add_event<E>(&self, channel: &str, mut event: E) -> Result<(), ServerError>
    where
        E: ServerEvent + 'static,
    {
        let mut events = self.shared.events.write().unwrap();
        if events.contains_key(channel) {
            return Err(ServerError::DuplicateChannel(channel.to_string()));
        }

        let out_tx = self.shared.out_tx.clone();
        let broadcast: BroadcastFn = Arc::new(move |packet| {
            let _ = out_tx.send(OutboundMessage::Broadcast { packet });
        });
        event.set_broadcast_fn(broadcast);

        events.insert(channel.to_string(), Box::new(event));
        Ok(())
    }

    pub fn set_tick_rate(&self, tick_rate: f32) -> Result<(), ServerError> {
        self.shared.processor.set_tick_rate(tick_rate)
    }

    pub fn real_tick_rate(&self) -> f32 {
        self.shared.processor.real_tick_rate()
    }

    /// Delays processing of every received datagram, simulating latency.
    pub fn set_artificial_delay(&self, delay: Duration) {
        *self.shared.artificial_delay.lock().unwrap() = Some(delay);
    }

    /// Queues a packet for every known connection.
    pub fn broadcast(&self, packet: Packet) {
        let _ = self.shared.out_tx.send(OutboundMessage::Broadcast { packet });
    }

    /// Starts the tick worker, sender task, and cleanup schedule, then runs
    /// the receive loop; resolves only on socket failure.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.shared.processor.start()?;

        if let Some(out_rx) = self.shared.out_rx.lock().unwrap().take() {
            spawn_sender(
                self.shared.socket.clone(),
                self.shared.connections.clone(),
                out_rx,
            );
        }

        let cleanup_connections = self.shared.connections.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let expired = cleanup_connections.write().await.cleanup_expired();
                if !expired.is_empty() {
                    debug!("swept {} expired connection(s)", expired.len());
                }
            }
        });

        info!("server listening on {}", self.shared.socket.local_addr()?);

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = self.shared.socket.recv_from(&mut buffer).await?;

            let message = match std::str::from_utf8(&buffer[..len]) {
                Ok(message) => message.to_string(),
                Err(_) => {
                    warn!("dropping non-UTF-8 datagram from {}", addr);
                    continue;
                }
            };

            let shared = self.shared.clone();
            tokio::spawn(async move {
                handle_datagram(shared, addr, message).await;
            });
        }
    }
}

fn spawn_sender(
    socket: Arc<UdpSocket>,
    connections: Arc<tokio::sync::RwLock<ConnectionManager>>,
    mut out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            match message {
                OutboundMessage::Send { packet, addr } => {
                    let data = packet.to_wire();
                    if let Err(err) = socket.send_to(data.as_bytes(), addr).await {
                        error!("failed to send to {}: {}", addr, err);
                    }
                }
                OutboundMessage::Broadcast { packet } => {
                    // A connection expiring between snapshot and send just
                    // loses the packet, which UDP allows anyway.
                    let endpoints = connections.read().await.endpoints();
                    let data = packet.to_wire();
                    for endpoint in endpoints {
                        if let Err(err) = socket.send_to(data.as_bytes(), endpoint).await {
                            error!("failed to broadcast to {}: {}", endpoint, err);
                        }
                    }
                }
            }
        }
    });
}

async fn handle_datagram(shared: Arc<ServerShared>, addr: SocketAddr, message: String) {
    let delay = *shared.artificial_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let packet = match Packet::parse(&message) {
        Ok(packet) => packet,
        Err(err) => {
            warn!("dropping malformed datagram from {}: {}", addr, err);
            return;
        }
    };

    if packet.is_internal() {
        handle_internal(&shared, addr, packet).await;
        return;
    }

    shared.processor.queue_packet(packet);
}

/// Internal channels are answered directly from the receive path; they never
/// touch the event processor queue.
async fn handle_internal(shared: &Arc<ServerShared>, addr: SocketAddr, packet: Packet) {
    match packet.channel.as_str() {
        CONNECT_CHANNEL => {
            let id = shared.connections.write().await.add_connection(addr);
            let response = Packet::new(CONNECT_CHANNEL, json!({ "connection_id": id }));
            let _ = shared.out_tx.send(OutboundMessage::Send {
                packet: response,
                addr,
            });
        }
        PING_CHANNEL => {
            let connection_id = packet.content.get("connection_id").and_then(Value::as_u64);
            let client_timestamp = packet.content.get("client_timestamp").and_then(Value::as_str);

            let (Some(connection_id), Some(client_timestamp)) = (connection_id, client_timestamp)
            else {
                warn!("malformed ping from {}: {}", addr, packet.content);
                return;
            };

            shared.connections.write().await.update_ping(connection_id as u32);

            let response = Packet::new(
                PING_CHANNEL,
                json!({
                    "client_timestamp": client_timestamp,
                    "server_tick_rate": shared.processor.real_tick_rate(),
                }),
            );
            let _ = shared.out_tx.send(OutboundMessage::Send {
                packet: response,
                addr,
            });
        }
        other => warn!("no internal event found for channel {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::DEFAULT_CONNECTION_TIMEOUT;
    use crate::event::{Event, Responder};
    use serde_json::json;
    use shared::Vec2;

    async fn test_server() -> Server {
        Server::new(0, DEFAULT_CONNECTION_TIMEOUT).await.unwrap()
    }

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let server = test_server().await;
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn duplicate_channel_registration_is_an_error() {
        let server = test_server().await;

        server
            .add_event("move", Event::new(|_: &Vec2, _: &Responder<Vec2>| {}))
            .unwrap();
        let second = server.add_event("move", Event::new(|_: &Vec2, _: &Responder<Vec2>| {}));

        assert!(matches!(second, Err(ServerError::DuplicateChannel(_))));
    }

    #[tokio::test]
    async fn tick_rate_setter_validates_through_to_the_processor() {
        let server = test_server().await;
        assert!(server.set_tick_rate(0.0).is_err());
        assert!(server.set_tick_rate(30.0).is_ok());
    }

    #[tokio::test]
    async fn connect_registers_and_replies_with_the_connection_id() {
        let server = test_server().await;
        let addr: SocketAddr = "[::1]:9999".parse().unwrap();

        handle_datagram(
            server.shared.clone(),
            addr,
            Packet::new(CONNECT_CHANNEL, Value::Null).to_wire(),
        )
        .await;

        assert_eq!(server.shared.connections.read().await.len(), 1);

        let mut out_rx = server.shared.out_rx.lock().unwrap().take().unwrap();
        match out_rx.try_recv().unwrap() {
            OutboundMessage::Send { packet, addr: to } => {
                assert_eq!(to, addr);
                assert_eq!(packet.channel, CONNECT_CHANNEL);
                assert_eq!(packet.content, json!({"connection_id": 1}));
            }
            _ => panic!("expected a direct reply"),
        }
    }

    #[tokio::test]
    async fn ping_echoes_the_timestamp_and_reports_the_tick_rate() {
        let server = test_server().await;
        let addr: SocketAddr = "[::1]:9998".parse().unwrap();

        handle_datagram(
            server.shared.clone(),
            addr,
            Packet::new(CONNECT_CHANNEL, Value::Null).to_wire(),
        )
        .await;

        let ping = Packet::new(
            PING_CHANNEL,
            json!({"connection_id": 1, "client_timestamp": "123456789"}),
        );
        handle_datagram(server.shared.clone(), addr, ping.to_wire()).await;

        let mut out_rx = server.shared.out_rx.lock().unwrap().take().unwrap();
        let _connect_reply = out_rx.try_recv().unwrap();
        match out_rx.try_recv().unwrap() {
            OutboundMessage::Send { packet, .. } => {
                assert_eq!(packet.channel, PING_CHANNEL);
                assert_eq!(
                    packet.content.get("client_timestamp").and_then(Value::as_str),
                    Some("123456789")
                );
                assert!(packet.content.get("server_tick_rate").is_some());
            }
            _ => panic!("expected a direct reply"),
        }
    }

    #[tokio::test]
    async fn malformed_datagrams_are_dropped() {
        let server = test_server().await;
        let addr: SocketAddr = "[::1]:9997".parse().unwrap();

        handle_datagram(server.shared.clone(), addr, "garbage".to_string()).await;
        handle_datagram(server.shared.clone(), addr, "move:NaN;{}".to_string()).await;

        assert!(server.shared.connections.read().await.is_empty());
    }

    #[tokio::test]
    async fn application_packets_are_queued_not_handled_inline() {
        let server = test_server().await;
        let handled = Arc::new(Mutex::new(0u32));
        let counter = handled.clone();
        server
            .add_event(
                "move",
                Event::new(move |_: &Vec2, _: &Responder<Vec2>| {
                    *counter.lock().unwrap() += 1;
                }),
            )
            .unwrap();

        let addr: SocketAddr = "[::1]:9996".parse().unwrap();
        let packet = Packet::with_id("move", json!({"x": 1.0, "y": 2.0}), 1);
        handle_datagram(server.shared.clone(), addr, packet.to_wire()).await;

        // Not processed until the tick worker drains the queue.
        assert_eq!(*handled.lock().unwrap(), 0);

        server.shared.processor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*handled.lock().unwrap(), 1);
    }
}
