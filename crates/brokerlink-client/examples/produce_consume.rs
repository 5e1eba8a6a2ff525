//! Produce/Consume Example
//!
//! Sends keyed orders into an in-memory cluster, reads them back as part of a
//! consumer group, and prints the topic layout.
//!
//! Run with:
//! ```bash
//! RUST_LOG=brokerlink_client=debug cargo run --package brokerlink-client --example produce_consume
//! ```

use std::sync::Arc;
use std::time::Duration;

use brokerlink_client::{
    ClientHandle, ConsumerConfig, ConsumerHandle, OffsetReset, ProducerConfig, ProducerHandle,
};
use brokerlink_sim::SimCluster;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cluster = SimCluster::builder()
        .brokers(3)
        .replication_factor(2)
        .topic("orders", 3)
        .topic("__consumer_offsets", 1)
        .build();
    let bootstrap = cluster.bootstrap_servers().await;

    println!("\nStep 1: Sending orders");
    let producer =
        ProducerHandle::connect(Arc::new(cluster.clone()), &bootstrap, ProducerConfig::default())
            .await?;
    for i in 0..9 {
        let customer = format!("cust-{}", i % 3);
        let order = format!("{{\"order_id\": {}, \"amount\": {}}}", i, i * 100);
        let ack = producer
            .send("orders", Some(customer.as_bytes()), order.as_bytes(), None)
            .await?;
        println!("  {} → partition {}, offset {}", customer, ack.partition, ack.offset);
    }

    println!("\nStep 2: Reading them back");
    let config = ConsumerConfig {
        auto_offset_reset: OffsetReset::Earliest,
        ..ConsumerConfig::default()
    };
    let consumer =
        ConsumerHandle::connect(Arc::new(cluster.clone()), &bootstrap, "order-audit", config)
            .await?;
    consumer.subscribe("orders").await?;
    let mut received = 0;
    while received < 9 {
        for record in consumer.poll(Duration::from_secs(1)).await? {
            received += 1;
            println!(
                "  {}-{}@{}: {}",
                record.topic,
                record.partition,
                record.offset,
                String::from_utf8_lossy(&record.value)
            );
        }
    }

    println!("\nStep 3: Topic layout");
    let handles: Vec<ClientHandle> = vec![producer.into(), consumer.into()];
    let admin = &handles[0];
    println!("  topics: {:?}", admin.list_topics(Duration::from_secs(1)).await?);
    let info = admin.topic_info("orders").await?;
    println!(
        "  orders: {} partitions, replication factor {}",
        info.partition_count, info.replication_factor
    );
    for partition in admin.partition_details("orders").await? {
        println!(
            "  partition {}: leader {}, replicas {:?}, offsets {}..{}",
            partition.id,
            partition.leader,
            partition.replicas,
            partition.earliest_offset,
            partition.latest_offset
        );
    }

    for handle in &handles {
        handle.close().await?;
    }
    println!("\nDone.");
    Ok(())
}
