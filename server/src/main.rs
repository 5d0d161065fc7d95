//! Demo server.
//!
//! Hosts two movement channels with a toy validation rule: positions past
//! x = 300 are clamped and rejected, so predicting clients visibly snap
//! back at the wall. Everything else is accepted and rebroadcast.

use clap::Parser;
use log::info;
use server::event::{Event, Responder};
use server::network::Server;
use shared::Vec2;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Ideal tick rate in Hz
    #[arg(short, long, default_value = "5.0")]
    tick_rate: f32,

    /// Seconds without a ping before a connection is dropped
    #[arg(short = 'T', long, default_value = "10")]
    connection_timeout: u64,
}

/// Clamps movement at the wall; rejected moves answer with the clamped
/// position so the client snaps onto the wall instead of through it.
fn handle_move(position: &Vec2, actions: &Responder<Vec2>, last_position: &Mutex<Vec2>) {
    if position.x > 300.0 {
        let clamped = Vec2::new(300.0, position.y);
        *last_position.lock().unwrap() = clamped;
        actions.reject(&clamped);
        return;
    }

    *last_position.lock().unwrap() = *position;
    actions.accept(position);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let server = Server::new(args.port, Duration::from_secs(args.connection_timeout)).await?;
    server.set_tick_rate(args.tick_rate)?;

    for channel in ["bluemove", "redmove"] {
        let last_position = Arc::new(Mutex::new(Vec2::default()));
        server.add_event(
            channel,
            Event::new(move |position: &Vec2, actions: &Responder<Vec2>| {
                handle_move(position, actions, &last_position);
            }),
        )?;
    }

    info!(
        "starting server on port {} at {} Hz",
        args.port, args.tick_rate
    );

    server.start().await?;
    Ok(())
}
