//! Headless demo client.
//!
//! Drives one predicted movement channel back and forth along the x axis
//! while observing a second channel in interpolate mode, logging positions
//! and ping updates. Pair it with the demo server and a second client with
//! swapped channels to watch prediction and rollback interact.

use clap::Parser;
use client::event::{InterpolatedEvent, PredictionMode};
use client::network::Client;
use log::info;
use shared::Vec2;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host name or address
    #[arg(short = 's', long, default_value = "::1")]
    server: String,

    /// Server port
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Channel this client owns and predicts
    #[arg(long, default_value = "bluemove")]
    own_channel: String,

    /// Channel this client observes and interpolates
    #[arg(long, default_value = "redmove")]
    other_channel: String,

    /// Artificial receive delay in milliseconds, for latency testing
    #[arg(short = 'd', long, default_value = "0")]
    delay: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let client = Client::new(&args.server, args.port).await?;
    if args.delay > 0 {
        info!("simulating {} ms receive delay", args.delay);
        client.set_artificial_delay(Duration::from_millis(args.delay));
    }

    let own = client.add_event(&args.own_channel, InterpolatedEvent::new(Vec2::default()))?;
    let other = client.add_event(
        &args.other_channel,
        InterpolatedEvent::with_mode(PredictionMode::Interpolate, Vec2::default()),
    )?;

    client.on_ping_update(|update| {
        info!(
            "ping {} ms, server tick rate {:.1}",
            update.ping_ms, update.server_tick_rate
        );
    });

    let runner = client.clone();
    tokio::spawn(async move {
        if let Err(err) = runner.start().await {
            log::error!("client stopped: {}", err);
        }
    });

    // Sweep the commanded position back and forth past the server's wall at
    // x = 300; sends beyond it are rejected, so the rendered value visibly
    // snaps back while the sweep keeps going. The observed channel is
    // sampled every frame to keep its spring stepping smoothly.
    let mut x = 0.0f32;
    let mut step = 5.0f32;
    let mut frame = 0u32;
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        tick.tick().await;

        x += step;
        if x >= 340.0 || x <= 0.0 {
            step = -step;
        }

        let own_pos = {
            let mut own = own.lock().unwrap();
            own.send(&Vec2::new(x, 0.0));
            own.get_current_value()
        };
        let other_pos = other.lock().unwrap().get_current_value();

        frame += 1;
        if frame % 10 == 0 {
            info!(
                "own ({:.1}, {:.1})  other ({:.1}, {:.1})  ping {} ms",
                own_pos.x, own_pos.y, other_pos.x, other_pos.y,
                client.get_ping()
            );
        }
    }
}
