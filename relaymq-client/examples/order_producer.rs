//! Publishes order events through a producer factory

use clap::Parser;
use relaymq_client::*;

#[derive(Parser, Debug)]
#[command(name = "order_producer")]
#[command(about = "Publish order events to a RelayMQ topic")]
struct Args {
    /// Name server address list, separated by `;`
    #[arg(long, default_value = "127.0.0.1:9876")]
    name_server: String,

    #[arg(short, long, default_value = "orders")]
    topic: String,

    #[arg(short, long, default_value = "10")]
    count: usize,

    /// Queues per broker when the topic is created
    #[arg(long, default_value = "4")]
    queues: u32,
}

const TAGS: [&str; 3] = ["order_create", "order_commit", "order_refund"];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    println!("RelayMQ - Order Producer Example");
    println!("================================");

    let factory = ProducerFactory::with_queue_num(&args.name_server, args.queues).await?;
    let producer = factory.get_topic_producer(&args.topic).await?;
    println!("Producer ready for topic {}", args.topic);

    for i in 0..args.count {
        let tag = TAGS[i % TAGS.len()];
        let message = Message::new(format!("order {} {}", i, tag))
            .with_tags(tag)
            .with_keys(format!("order-{}", i));

        match producer.publish(message).await {
            Ok(result) => println!(
                "  #{} {} -> {} offset={} status={:?}",
                i, tag, result.queue, result.queue_offset, result.status
            ),
            Err(e) => eprintln!("  #{} {} failed: {}", i, tag, e),
        }
    }

    let snapshot = metrics::global_metrics().snapshot();
    println!(
        "Sent {} message(s), mean latency {:?}",
        snapshot.messages_sent, snapshot.mean_send_latency
    );

    factory.close().await?;
    println!("Factory closed");
    Ok(())
}
