//! Bulk product publishing example.
//!
//! This example fills a connection pool, publishes a batch of product
//! creation messages concurrently, and prints pool status along the way.
//!
//! # Running
//!
//! ```bash
//! export RABBITMQ_HOST=localhost
//! export RABBITMQ_USER=admin
//! export RABBITMQ_PASSWORD=admin
//!
//! cargo run -p broker-amqp --example bulk_publish
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use broker_amqp::{AmqpConnector, AmqpPool};
use broker_pool::{ConnectionConfig, ConnectionPool, Producer, RetryPolicy};
use serde::Serialize;
use tokio::time::Instant;

const QUEUE: &str = "bulk_products";

#[derive(Debug, Serialize)]
struct ProductCreated {
    sku: String,
    name: String,
    price_cents: u64,
    stock: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ConnectionConfig::from_env()?;

    println!("=== Bulk Product Publishing Example ===\n");

    let retry = RetryPolicy::new()
        .max_retries(10)
        .initial_backoff(Duration::from_millis(500))
        .max_backoff(Duration::from_secs(5));

    let pool: AmqpPool = ConnectionPool::builder(AmqpConnector::new())
        .connection_config(config)
        .pool_size(4)
        .retry(retry)
        .health_check_interval(Duration::from_secs(30))
        .build()
        .await?;

    print_pool_status(&pool);

    let producer = Producer::new(pool.clone());

    println!("\nPublishing 50 products across 10 tasks:");
    let start = Instant::now();
    let mut tasks = Vec::new();
    for worker in 0..10u32 {
        let producer = producer.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..5u32 {
                let product = ProductCreated {
                    sku: format!("SKU-{worker:02}-{i:02}"),
                    name: format!("Product {worker}/{i}"),
                    price_cents: u64::from(1_000 + worker * 10 + i),
                    stock: 10 * (i + 1),
                };
                producer.publish_json(QUEUE, QUEUE, &product).await?;
            }
            Ok::<_, broker_pool::PublishError>(())
        }));
    }

    for task in tasks {
        task.await.expect("task panicked")?;
    }
    println!("  done in {:?}", start.elapsed());

    print_pool_status(&pool);

    pool.close_all().await;
    println!("\nPool closed.");
    print_pool_status(&pool);

    Ok(())
}

fn print_pool_status(pool: &AmqpPool) {
    let status = pool.status();
    println!("Pool status:");
    println!("  Idle: {}/{}", status.idle, status.pool_size);
    println!("  Created: {}", status.created);
    println!("  Exhausted: {}", status.exhausted);
    println!("  Stale discarded: {}", status.stale_discarded);
}
