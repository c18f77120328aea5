// Minimal publisher: send one message to a topic and exit.
//
// Run with: cargo run --example publish -- <topic> <nsqd-addr> <message>

use nsq_client::{IdentifyOptions, Producer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let topic = args.next().unwrap_or_else(|| "events".to_string());
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:4150".to_string());
    let message = args
        .next()
        .unwrap_or_else(|| "hello from nsq-client".to_string());

    let mut producer = Producer::connect(&addr, &IdentifyOptions::default()).await?;
    producer.publish(&topic, message.as_bytes()).await?;
    println!("published to {topic}");

    Ok(())
}
