//! Critically-damped spring interpolation toward a moving target.
//!
//! Clients receive authoritative values at the server tick rate (a handful
//! of updates per second) but render at display rate. The [`Interpolator`]
//! bridges the two by treating the latest authoritative value as the rest
//! position of a spring: the rendered value accelerates toward the target
//! and, because the damping is kept at the critical value, settles without
//! overshooting.

use std::ops::{Add, Mul, Sub};
use std::time::Instant;

/// Distance below which the current value snaps onto the target.
const SNAP_THRESHOLD: f32 = 0.01;

/// Value types that can be driven by the spring.
pub trait Interpolatable:
    Copy + Add<Output = Self> + Sub<Output = Self> + Mul<f32, Output = Self>
{
    fn length(&self) -> f32;
}

/// Stiffness that settles within `settle_ticks` server ticks.
pub fn stiffness_for(tick_rate: f32, settle_ticks: f32) -> f32 {
    let tau = settle_ticks / tick_rate;
    1.5 / (tau * tau)
}

/// [`stiffness_for`] with the default settle window of two ticks.
pub fn tick_rate_stiffness(tick_rate: f32) -> f32 {
    stiffness_for(tick_rate, 2.0)
}

pub struct Interpolator<T: Interpolatable> {
    current_value: T,
    target_value: T,
    velocity: T,
    last_update: Instant,
    stiffness: f32,
    damping: f32,
}

impl<T: Interpolatable> Interpolator<T> {
    pub fn new(initial_value: T) -> Self {
        let stiffness = 1.0;
        Self {
            current_value: initial_value,
            target_value: initial_value,
            velocity: initial_value * 0.0,
            last_update: Instant::now(),
            stiffness,
            damping: 2.0 * stiffness.sqrt(),
        }
    }

    pub fn update_target(&mut self, new_target: T) {
        self.target_value = new_target;
    }

    /// Advances the spring by the wall-clock time since the previous call
    /// and returns the new current value.
    pub fn update(&mut self) -> T {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f32();
        self.last_update = now;

        let delta = self.target_value - self.current_value;
        let acceleration = delta * self.stiffness - self.velocity * self.damping;
        self.velocity = self.velocity + acceleration * dt;
        self.current_value = self.current_value + self.velocity * dt;

        if (self.target_value - self.current_value).length() < SNAP_THRESHOLD {
            self.current_value = self.target_value;
            self.velocity = self.current_value * 0.0;
        }

        self.current_value
    }

    /// Keeps the spring critically damped for the new stiffness.
    pub fn set_stiffness(&mut self, stiffness: f32) {
        self.stiffness = stiffness;
        self.damping = 2.0 * stiffness.sqrt();
    }

    pub fn set_velocity(&mut self, velocity: T) {
        self.velocity = velocity;
    }

    pub fn current(&self) -> T {
        self.current_value
    }
}
