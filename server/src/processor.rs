//! Fixed-tick event processing on a dedicated worker thread.
//!
//! Non-internal packets are queued as they arrive and drained once per tick
//! by the processor function. The queue is snapshotted and cleared under its
//! lock before any handler runs, so handlers may enqueue further packets
//! without deadlocking; those are picked up on the next tick.

use crate::error::ServerError;
use log::{debug, error};
use shared::Packet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_TICK_RATE: f32 = 5.0;

pub type ProcessorFn = Arc<dyn Fn(&Packet) + Send + Sync>;

struct TickRates {
    ideal: f32,
    real: f32,
}

struct ProcessorShared {
    queue: Mutex<Vec<Packet>>,
    rates: Mutex<TickRates>,
    running: AtomicBool,
}

/// Drains queued packets at a fixed ideal rate and measures the rate it
/// actually achieves.
///
/// [`start`] spawns a worker thread with its own single-threaded runtime;
/// dropping the processor (or calling [`stop`]) shuts the worker down and
/// joins it.
///
/// [`start`]: EventProcessor::start
/// [`stop`]: EventProcessor::stop
pub struct EventProcessor {
    shared: Arc<ProcessorShared>,
    processor_fn: ProcessorFn,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventProcessor {
    pub fn new(processor_fn: impl Fn(&Packet) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(ProcessorShared {
                queue: Mutex::new(Vec::new()),
                rates: Mutex::new(TickRates {
                    ideal: DEFAULT_TICK_RATE,
                    real: 0.0,
                }),
                running: AtomicBool::new(false),
            }),
            processor_fn: Arc::new(processor_fn),
            worker: Mutex::new(None),
        }
    }

    /// Queues a packet for the next tick. Never blocks on the drain.
    pub fn queue_packet(&self, packet: Packet) {
        self.shared.queue.lock().unwrap().push(packet);
    }

    pub fn set_tick_rate(&self, tick_rate: f32) -> Result<(), ServerError> {
        if tick_rate <= 0.0 {
            return Err(ServerError::InvalidTickRate(tick_rate));
        }
        self.shared.rates.lock().unwrap().ideal = tick_rate;
        Ok(())
    }

    /// The measured tick rate, never above the ideal rate.
    pub fn real_tick_rate(&self) -> f32 {
        self.shared.rates.lock().unwrap().real
    }

    /// Spawns the tick worker. A second call while running is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let processor_fn = self.processor_fn.clone();
        let handle = std::thread::Builder::new()
            .name("event-processor".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!("could not build tick runtime: {}", err);
                        return;
                    }
                };
                runtime.block_on(tick_loop(shared, processor_fn));
            })?;

        *worker = Some(handle);
        Ok(())
    }

    /// Signals the worker to stop and joins it. The worker notices within
    /// one tick period.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn tick_loop(shared: Arc<ProcessorShared>, processor_fn: ProcessorFn) {
    debug!("event processor started");
    let mut snapshot: Vec<Packet> = Vec::new();

    while shared.running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();
        let period = {
            let rates = shared.rates.lock().unwrap();
            Duration::from_secs_f32(1.0 / rates.ideal)
        };

        // Swap the queue out under the lock; handlers run without it so they
        // are free to queue packets for the next tick.
        {
            let mut queue = shared.queue.lock().unwrap();
            std::mem::swap(&mut snapshot, &mut *queue);
        }

        for packet in snapshot.drain(..) {
            processor_fn(&packet);
        }

        let elapsed = tick_start.elapsed();
        update_real_tick_rate(&shared, elapsed);

        if elapsed < period {
            tokio::time::sleep(period - elapsed).await;
        } else {
            // Behind schedule: keep draining but stay cooperative.
            tokio::task::yield_now().await;
        }
    }

    debug!("event processor stopped");
}

fn update_real_tick_rate(shared: &ProcessorShared, elapsed: Duration) {
    let elapsed_ms = elapsed.as_secs_f32() * 1000.0;
    let mut rates = shared.rates.lock().unwrap();

    rates.real = if elapsed_ms > 0.0 {
        (1000.0 / elapsed_ms).min(rates.ideal)
    } else {
        rates.ideal
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn packet(id: i32) -> Packet {
        Packet::with_id("move", json!({"x": 0.0, "y": 0.0}), id)
    }

    #[test]
    fn rejects_zero_and_negative_tick_rates() {
        let processor = EventProcessor::new(|_| {});

        assert!(matches!(
            processor.set_tick_rate(0.0),
            Err(ServerError::InvalidTickRate(_))
        ));
        assert!(matches!(
            processor.set_tick_rate(-5.0),
            Err(ServerError::InvalidTickRate(_))
        ));
        assert!(processor.set_tick_rate(30.0).is_ok());
    }

    #[test]
    fn drains_queued_packets_within_a_tick() {
        let processed = Arc::new(AtomicU32::new(0));
        let counter = processed.clone();
        let processor = EventProcessor::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        processor.set_tick_rate(50.0).unwrap();

        processor.queue_packet(packet(1));
        processor.queue_packet(packet(2));
        processor.start().unwrap();

        std::thread::sleep(Duration::from_millis(200));
        processor.stop();

        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn packets_queued_while_running_are_processed_next_tick() {
        let processed = Arc::new(Mutex::new(Vec::new()));
        let sink = processed.clone();
        let processor = EventProcessor::new(move |packet: &Packet| {
            sink.lock().unwrap().push(packet.packet_id);
        });
        processor.set_tick_rate(50.0).unwrap();
        processor.start().unwrap();

        std::thread::sleep(Duration::from_millis(50));
        processor.queue_packet(packet(1));
        std::thread::sleep(Duration::from_millis(100));
        processor.queue_packet(packet(2));
        std::thread::sleep(Duration::from_millis(100));
        processor.stop();

        assert_eq!(*processed.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn real_tick_rate_is_capped_by_the_ideal_rate() {
        let processor = EventProcessor::new(|_| {});
        processor.set_tick_rate(50.0).unwrap();
        processor.start().unwrap();

        // Idle ticks finish instantly, so the measured rate sits at the cap.
        std::thread::sleep(Duration::from_millis(300));
        let real = processor.real_tick_rate();
        processor.stop();

        assert!(real > 0.0);
        assert!(real <= 50.0 + f32::EPSILON);
        assert!((real - 50.0).abs() < 1.0, "idle rate should equal the ideal rate");
    }

    #[test]
    fn handlers_may_enqueue_follow_up_packets() {
        let processed = Arc::new(AtomicU32::new(0));

        // The handler queues one follow-up for the first packet it sees,
        // from inside the drain. The snapshot pattern must neither deadlock
        // nor lose it; the follow-up arrives on the next tick.
        let slot: Arc<Mutex<Option<Arc<EventProcessor>>>> = Arc::new(Mutex::new(None));
        let counter = processed.clone();
        let handler_slot = slot.clone();
        let processor = Arc::new(EventProcessor::new(move |incoming: &Packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            if incoming.packet_id == 1 {
                if let Some(processor) = handler_slot.lock().unwrap().as_ref() {
                    processor.queue_packet(packet(2));
                }
            }
        }));
        *slot.lock().unwrap() = Some(processor.clone());

        processor.set_tick_rate(50.0).unwrap();
        processor.start().unwrap();

        processor.queue_packet(packet(1));
        std::thread::sleep(Duration::from_millis(150));
        processor.stop();
        slot.lock().unwrap().take();

        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_joins_the_worker_thread() {
        let processor = EventProcessor::new(|_| {});
        processor.start().unwrap();
        processor.stop();
        // A stopped processor can still queue without panicking.
        processor.queue_packet(packet(1));
    }
}
