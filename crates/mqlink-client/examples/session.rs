//! Session manager example: observer, per-op callbacks and chained commands.
//!
//! Run with: cargo run -p mqlink-client --example session
//!
//! Expects a broker on localhost:1883.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mqlink_client::{ConnectOptions, Event, QoS, SessionManager, Will};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = SessionManager::with_tcp_engine()?;
    let handle = session.handle();
    let done = Arc::new(AtomicBool::new(false));

    // The global observer sees every event, including messages.
    let finished = done.clone();
    let observer_handle = handle.clone();
    session.init(move |event: &Event| match event {
        Event::Message { topic, .. } => {
            println!(
                "Message: {} -> {}",
                topic,
                event.payload_str().unwrap_or("<binary>")
            );
            // Leave once our own message came back.
            if let Err(e) = observer_handle.disconnect(None) {
                eprintln!("disconnect: {}", e);
            }
        }
        Event::Disconnected { .. } | Event::Error { .. } => {
            println!("{}", event);
            finished.store(true, Ordering::SeqCst);
        }
        _ => println!("{}", event),
    });

    let options = ConnectOptions::new("localhost")
        .client_id("session-example")
        .keep_alive(30)
        .will(Will::new("example/session/status", "gone").retain(true));

    // Subscribe and publish once the broker accepts the connection.
    session.connect(
        options,
        Some(Box::new(move |event: &Event| {
            if event.is_error() {
                return;
            }
            let _ = handle.subscribe("example/session/#", QoS::AtLeastOnce, None);
            let _ = handle.publish(
                "example/session/hello",
                "Hello from mqlink!",
                QoS::AtLeastOnce,
                false,
                Some(Box::new(|ack: &Event| println!("Publish acknowledged: {}", ack))),
            );
        })),
    )?;

    while !done.load(Ordering::SeqCst) {
        session.dispatch_timeout(Duration::from_millis(100));
    }
    Ok(())
}
