//! Send-side coalescing of outbound packets.
//!
//! Interactive input produces far more value changes per second than the
//! server consumes, so outbound traffic is pooled per channel: at most one
//! packet leaves within each trigger interval, and a one-shot timer flushes
//! the newest value of a burst so the final state is never lost.

use log::warn;
use shared::Packet;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type PoolListener = Box<dyn Fn(&Packet) + Send + Sync>;

struct PooledEntry {
    /// When this channel last flushed a packet to the listeners.
    insertion: Instant,
    /// When `pool` was last called for this channel.
    last_insertion: Instant,
    packet: Packet,
    scheduled: bool,
}

struct PoolTiming {
    timeout: Duration,
    trigger: Duration,
}

struct PoolInner {
    entries: Mutex<HashMap<String, PooledEntry>>,
    timing: Mutex<PoolTiming>,
    listeners: Mutex<Vec<PoolListener>>,
}

impl PoolInner {
    /// Listener invocation happens with the entry map unlocked so listeners
    /// may pool further packets.
    fn notify(&self, packet: &Packet) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(packet);
        }
    }
}

/// Per-channel send coalescer.
///
/// Must be created inside a tokio runtime: deferred flushes are armed as
/// tasks on the runtime the pool was created on.
#[derive(Clone)]
pub struct EventPool {
    inner: Arc<PoolInner>,
    runtime: tokio::runtime::Handle,
}

impl EventPool {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: Mutex::new(HashMap::new()),
                timing: Mutex::new(PoolTiming {
                    timeout: Self::DEFAULT_TIMEOUT,
                    trigger: Self::DEFAULT_TIMEOUT / 2,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Submits a packet for its channel.
    ///
    /// The first packet on a channel, and any packet arriving after the
    /// trigger interval has passed since the last flush, goes out at once.
    /// Packets inside the trigger window replace the held value and arm a
    /// single deferred flush per channel.
    pub fn pool(&self, packet: Packet) {
        let now = Instant::now();
        let (timeout, trigger) = {
            let timing = self.inner.timing.lock().unwrap();
            (timing.timeout, timing.trigger)
        };

        let mut flush = None;
        {
            let mut entries = self.inner.entries.lock().unwrap();

            match entries.entry(packet.channel.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(PooledEntry {
                        insertion: now,
                        last_insertion: now,
                        packet: packet.clone(),
                        scheduled: false,
                    });
                    flush = Some(packet);
                }
                Entry::Occupied(mut occupied) => {
                    let channel = occupied.key().clone();
                    let entry = occupied.get_mut();
                    entry.last_insertion = now;

                    if now.duration_since(entry.insertion) > trigger && !entry.scheduled {
                        entry.insertion = now;
                        flush = Some(packet);
                    } else {
                        entry.packet = packet;

                        if !entry.scheduled {
                            entry.scheduled = true;
                            let inner = self.inner.clone();
                            self.runtime.spawn(async move {
                                tokio::time::sleep(timeout).await;
                                flush_scheduled(&inner, &channel);
                            });
                        }
                    }
                }
            }
        }

        if let Some(packet) = flush {
            self.inner.notify(&packet);
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&Packet) + Send + Sync + 'static) {
        self.inner.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Reconfigures the coalescing window; the trigger interval tracks at
    /// half the timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut timing = self.inner.timing.lock().unwrap();
        timing.timeout = timeout;
        timing.trigger = timeout / 2;
    }
}

/// Timer expiry for a scheduled channel: clear the flag under the lock,
/// then deliver the newest held packet.
fn flush_scheduled(inner: &Arc<PoolInner>, channel: &str) {
    let flushed = {
        let mut entries = inner.entries.lock().unwrap();
        match entries.get_mut(channel) {
            Some(entry) => {
                entry.scheduled = false;
                entry.packet.clone()
            }
            None => {
                warn!("pooled channel {} vanished before flush", channel);
                return;
            }
        }
    };

    inner.notify(&flushed);
}
