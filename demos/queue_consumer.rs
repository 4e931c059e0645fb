// Pops records from the demo public queue and checks every hash.
//
//   cargo run --example queue_consumer -- 1000

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
        eprintln!("Usage: {} <expected_messages>", args[0]);
        std::process::exit(1);
    }
    let expected: u64 = match args[1].parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Invalid number of messages: {}", args[1]);
            std::process::exit(1);
        }
    };

    dmxp_ipc::init(demo_config())?;
    let queue = MessageQueue::<DemoRecord>::open_public(DEMO_QUEUE_ID, QueueMode::ReadOnly)?;
    println!("Consumer: Opened {:?}", queue);

    let keep_alive = Arc::new(AtomicBool::new(true));
    let keep_alive_for_handler = Arc::clone(&keep_alive);
    if let Err(e) = ctrlc::set_handler(move || {
        keep_alive_for_handler.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Error setting Ctrl+C handler: {}", e);
    }

    let start = std::time::Instant::now();
    let mut last_seen = std::time::Instant::now();
    let mut received = 0u64;
    let mut mismatched = 0u64;
    println!("\n{:<10} {}", "Msg #", "Hash");
    println!("{}", "=".repeat(80));

    while received < expected && keep_alive.load(Ordering::SeqCst) {
        match queue.pop(false)? {
            Some(record) => {
                last_seen = std::time::Instant::now();
                if record.hash != hash_of(record.seq) {
                    mismatched += 1;
                    eprintln!("Hash mismatch for message {}", record.seq);
                }
                received += 1;
                if received % 100 == 0 {
                    println!("{:<10} {}", record.seq, record.hash);
                }
            }
            None => {
                if last_seen.elapsed() > std::time::Duration::from_secs(5) {
                    eprintln!("Timeout waiting for messages");
                    break;
                }
                std::thread::yield_now();
            }
        }
    }

    let elapsed = start.elapsed();
    println!("\n{}", "=".repeat(80));
    println!("Consumer: Received {} messages in {:.2?}", received, elapsed);
    println!(
        "Average: {:.2} messages/second",
        received as f64 / elapsed.as_secs_f64()
    );
    if received == expected && mismatched == 0 {
        println!("All messages received and verified");
    } else {
        println!("{} missing, {} mismatched", expected - received, mismatched);
    }
    Ok(())
}
