//! # Client Library
//!
//! The client side of the event framework: a UDP runtime with the internal
//! `!connect`/`!ping` handshake, a typed event registry, send-side
//! coalescing, and client-side prediction with spring interpolation for
//! continuous channels.
//!
//! ## Typical use
//!
//! ```no_run
//! use client::event::{InterpolatedEvent, PredictionMode};
//! use client::network::Client;
//! use shared::Vec2;
//!
//! # async fn demo() -> Result<(), client::error::ClientError> {
//! let client = Client::new("::1", 3000).await?;
//!
//! // Our own movement: predicted locally, corrected on reject.
//! let own = client.add_event("bluemove", InterpolatedEvent::new(Vec2::default()))?;
//! // The other player's movement: interpolated toward each broadcast.
//! let other = client.add_event(
//!     "redmove",
//!     InterpolatedEvent::with_mode(PredictionMode::Interpolate, Vec2::default()),
//! )?;
//!
//! let runner = client.clone();
//! tokio::spawn(async move { runner.start().await });
//!
//! own.lock().unwrap().send(&Vec2::new(5.0, 0.0));
//! let rendered = other.lock().unwrap().get_current_value();
//! # let _ = rendered;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod network;
pub mod pool;

pub use error::ClientError;
pub use event::{ClientEvent, Event, InterpolatedEvent, PredictionMode};
pub use network::{Client, PingUpdate};
pub use pool::EventPool;
