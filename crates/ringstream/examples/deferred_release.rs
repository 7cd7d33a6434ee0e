//! # Deferred Release Example
//!
//! Walks through one stream's lifecycle:
//! - Creating a stream and attaching its listener thread
//! - Tracking buffers used by queued work
//! - Releasing them with a host callback barrier
//! - Tearing the stream down
//!
//! ## Run this example:
//! ```bash
//! RUST_LOG=debug cargo run -p ringstream --example deferred_release
//! ```

use std::sync::mpsc;

use ringstream::prelude::*;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== RingStream Deferred Release Example ===\n");

    println!("1. Creating runtime and stream...");
    let runtime = StreamRuntime::builder().build();
    let stream = runtime.create_stream(0, LaunchPolicy::LaunchSync)?;
    println!("   Queue: {:?}", stream.queue());

    println!("2. Starting async mode...");
    stream.start_async_mode()?;
    println!("   Listeners running: {}\n", runtime.active_listeners());

    println!("3. Queueing work that uses three buffers...");
    let buffers: Vec<_> = (0..3).map(|_| DeviceBuffer::alloc(0, 1024)).collect();
    for (i, buffer) in buffers.iter().enumerate() {
        let data = buffer.clone();
        stream.enqueue(move || {
            data.write(&[i as u8; 16]);
        })?;
        stream.add_buffer_ref(buffer.clone());
    }
    let queue = stream.queue().ok_or("stream has no queue")?;
    println!(
        "   Tracked buffers: {:?}",
        runtime.context().registry().pending(queue)
    );

    println!("4. Launching a completion callback...");
    let (tx, rx) = mpsc::channel();
    stream.launch_callback(move || {
        let _ = tx.send(std::thread::current().name().map(str::to_owned));
    })?;
    stream.synchronize()?;
    println!("   Callback ran on: {:?}", rx.recv()?);
    println!(
        "   Tracked buffers after release: {:?}",
        runtime.context().registry().pending(queue)
    );
    for buffer in &buffers {
        println!(
            "   buffer {:?}: first byte {:?}, handles {}",
            buffer.id(),
            buffer.to_vec().first(),
            buffer.handle_count()
        );
    }

    println!("\n5. Destroying stream...");
    stream.destroy()?;
    println!("   Listeners running: {}", runtime.active_listeners());

    runtime.shutdown()?;
    println!("\n=== Example completed ===");
    Ok(())
}
