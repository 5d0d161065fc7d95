//! # Shared Protocol Library
//!
//! Data structures and algorithms used by both the game client and server:
//! the wire [`Packet`] codec, the [`Vec2`] value type exchanged on movement
//! channels, and the critically-damped [`Interpolator`] that clients use to
//! smooth remote state between authoritative broadcasts.
//!
//! ## Wire format
//!
//! Every datagram is UTF-8 text of the form `channel:id;payload` where
//! `payload` is a JSON document. Channels whose name starts with `!` are
//! reserved for framework-internal traffic (connection handshake and pings).
//!
//! ## Determinism
//!
//! The interpolation constants are shared so that the same ping and server
//! tick rate produce the same visual motion on every client.

pub mod interpolation;
pub mod packet;

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use interpolation::{Interpolatable, Interpolator};
pub use packet::{
    Packet, PacketError, CONNECT_CHANNEL, INTERNAL_PREFIX, MAX_DATAGRAM_SIZE, PING_CHANNEL,
};

/// A 2-D float vector, the typical payload of an interpolated channel.
///
/// Serialises to `{"x": .., "y": ..}` which is the schema the reference
/// movement channels use on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;

    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

impl Interpolatable for Vec2 {
    fn length(&self) -> f32 {
        Vec2::length(self)
    }
}

impl Interpolatable for f32 {
    fn length(&self) -> f32 {
        self.abs()
    }
}

/// Milliseconds since the Unix epoch.
///
/// Used for ping timestamps; both sides exchange it as a decimal string.
pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn vec2_arithmetic() {
        let a = Vec2::new(1.0, 2.0);
        let b = Vec2::new(3.0, -1.0);

        assert_eq!(a + b, Vec2::new(4.0, 1.0));
        assert_eq!(a - b, Vec2::new(-2.0, 3.0));
        assert_eq!(a * 2.0, Vec2::new(2.0, 4.0));
    }

    #[test]
    fn vec2_length() {
        assert_approx_eq!(Vec2::new(3.0, 4.0).length(), 5.0, 1e-6);
        assert_eq!(Vec2::default().length(), 0.0);
    }

    #[test]
    fn vec2_wire_schema() {
        let value = serde_json::to_value(Vec2::new(10.0, -2.5)).unwrap();
        assert_eq!(value, serde_json::json!({"x": 10.0, "y": -2.5}));

        let back: Vec2 = serde_json::from_value(value).unwrap();
        assert_eq!(back, Vec2::new(10.0, -2.5));
    }

    #[test]
    fn timestamp_is_monotonic_enough() {
        let a = unix_timestamp_ms();
        std::thread::sleep(Duration::from_millis(2));
        let b = unix_timestamp_ms();
        assert!(b > a);
    }
}
