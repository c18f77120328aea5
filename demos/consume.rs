// Minimal consumer loop: subscribe to a topic/channel and FIN every message.
//
// Run with: cargo run --example consume -- <topic> <channel> <nsqd-addr>

use nsq_client::topic::{Channel, Topic};
use nsq_client::{Consumer, ConsumerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let topic: Topic = args
        .next()
        .unwrap_or_else(|| "events".to_string())
        .parse()?;
    let channel: Channel = args
        .next()
        .unwrap_or_else(|| "demo".to_string())
        .parse()?;
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:4150".to_string());

    let config = ConsumerConfig::default()
        .with_nsqd_addresses([addr])
        .with_max_in_flight(10);

    let mut consumer = Consumer::connect(topic, channel, config).await?;

    while let Some(delivery) = consumer.next_message().await {
        let id = delivery.message.id_str().into_owned();
        println!("message {id}: {} bytes", delivery.message.body.len());
        delivery.connection.send_fin(&id);
    }

    Ok(())
}
