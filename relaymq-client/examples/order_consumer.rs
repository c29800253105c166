//! Consumes order events through a consumer container until Ctrl-C

use clap::Parser;
use relaymq_client::*;

#[derive(Parser, Debug)]
#[command(name = "order_consumer")]
#[command(about = "Consume order events from a RelayMQ topic")]
struct Args {
    /// Name server address list, separated by `;`
    #[arg(long, default_value = "127.0.0.1:9876")]
    name_server: String,

    #[arg(short, long, default_value = "order-service")]
    group: String,

    #[arg(short, long, default_value = "orders")]
    topic: String,

    /// Tags to subscribe to; all tags when omitted
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    println!("RelayMQ - Order Consumer Example");
    println!("================================");

    let container = ConsumerContainer::new(&args.name_server)?;
    container
        .add_topic_consumer(
            &args.group,
            &args.topic,
            |queue, messages| {
                for message in messages {
                    println!(
                        "  {} offset={} tag={} body={}",
                        queue,
                        message.queue_offset,
                        message.tags.as_deref().unwrap_or("-"),
                        String::from_utf8_lossy(&message.body)
                    );
                }
                true
            },
            args.tags.clone(),
        )
        .await?;

    println!("Consuming {} as {}; press Ctrl-C to stop", args.topic, args.group);
    tokio::signal::ctrl_c().await?;

    container.close().await?;
    println!("Container closed");
    Ok(())
}
