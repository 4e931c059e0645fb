// Pushes SHA-256 tagged records into the demo public queue.
//
//   cargo run --example queue_producer -- 1000 [--auto-exit]

#[path = "demo_config.rs"]
mod demo_config;

use demo_config::{demo_config, hash_of, DemoRecord, DEMO_QUEUE_ID};
use dmxp_ipc::Queue::{MessageQueue, QueueMode};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> dmxp_ipc::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_messages> [--auto-exit]", args[0]);
        std::process::exit(1);
    }
    let num_messages: u64 = match args[1].parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Invalid number of messages: {}", args[1]);
            std::process::exit(1);
        }
    };
    let auto_exit = args.get(2).map(|s| s == "--auto-exit").unwrap_or(false);

    dmxp_ipc::init(demo_config())?;

    println!("Producer: Precomputing {} hashes...", num_messages);
    let start_precompute = std::time::Instant::now();
    let records: Vec<DemoRecord> = (0..num_messages)
        .map(|seq| DemoRecord {
            seq,
            hash: hash_of(seq),
        })
        .collect();
    println!(
        "Producer: Precomputed {} hashes in {:.2?}",
        num_messages,
        start_precompute.elapsed()
    );

    let queue = MessageQueue::<DemoRecord>::open_public(DEMO_QUEUE_ID, QueueMode::WriteOnly)?;
    println!("Producer: Opened {:?}", queue);

    let keep_alive = Arc::new(AtomicBool::new(true));
    let keep_alive_for_handler = Arc::clone(&keep_alive);
    if let Err(e) = ctrlc::set_handler(move || {
        keep_alive_for_handler.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Error setting Ctrl+C handler: {}", e);
    }

    let start_send = std::time::Instant::now();
    let mut sent = 0u64;
    for record in &records {
        // Non-blocking so Ctrl+C is noticed while the consumer lags.
        while !queue.push(record, false)? {
            if !keep_alive.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_micros(10));
        }
        if !keep_alive.load(Ordering::SeqCst) {
            break;
        }
        sent += 1;
        if sent % 100 == 0 {
            println!("Sent {} messages", sent);
        }
    }

    let send_time = start_send.elapsed();
    println!("Producer: Sent {} messages in {:.2?}", sent, send_time);
    println!(
        "Producer: Throughput: {:.2} messages/sec",
        sent as f64 / send_time.as_secs_f64()
    );

    if auto_exit {
        println!("Producer: Auto-exit mode, waiting 2 seconds for consumer...");
        std::thread::sleep(std::time::Duration::from_secs(2));
    } else {
        println!("Press Ctrl+C to exit...");
        while keep_alive.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }
    println!("Producer: Shutting down");
    Ok(())
}
