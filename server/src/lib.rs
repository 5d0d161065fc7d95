//! # Server Library
//!
//! The authoritative side of the event framework. The server owns the
//! connection roster and the decision to accept or reject every application
//! event; clients predict optimistically and conform to what is broadcast
//! back.
//!
//! ## Architecture
//!
//! The main reactor runs the UDP receive loop. Datagrams on internal `!`
//! channels (handshake, pings) are answered synchronously there; everything
//! else is queued for the [`processor::EventProcessor`], which drains the
//! queue at a fixed tick rate on its own worker thread and dispatches each
//! packet to the registered [`event::ServerEvent`] handler. Handlers answer
//! through a [`event::Responder`]: accepting rebroadcasts the value under
//! the request's id, rejecting rebroadcasts it under the reject id so the
//! originating client rolls back its prediction.
//!
//! Outbound traffic (replies and broadcasts) is funnelled through a sender
//! task so handlers on the tick thread never touch the socket directly.
//!
//! ## Typical use
//!
//! ```no_run
//! use server::event::{Event, Responder};
//! use server::network::Server;
//! use shared::Vec2;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), server::error::ServerError> {
//! let server = Server::new(3000, Duration::from_secs(10)).await?;
//!
//! server.add_event(
//!     "move",
//!     Event::new(|position: &Vec2, actions: &Responder<Vec2>| {
//!         if position.x > 300.0 {
//!             actions.reject(&Vec2::new(300.0, position.y));
//!         } else {
//!             actions.accept(position);
//!         }
//!     }),
//! )?;
//!
//! server.start().await
//! # }
//! ```

pub mod connection_manager;
pub mod error;
pub mod event;
pub mod network;
pub mod processor;

pub use connection_manager::{Connection, ConnectionManager, DEFAULT_CONNECTION_TIMEOUT};
pub use error::ServerError;
pub use event::{Event, JsonEvent, Responder, ServerEvent};
pub use network::Server;
pub use processor::{EventProcessor, DEFAULT_TICK_RATE};
