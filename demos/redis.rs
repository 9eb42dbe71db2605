//! Redis example: two governors sharing limits through one Redis instance.
//!
//! Run with a local Redis:
//! `cargo run --example redis --features redis-store`

use request_governance::{
    CallerContext, Clock, GovernorBuilder, OperationContext, Rate, RedisStore, SystemClock,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = match RedisStore::connect("redis://127.0.0.1/", Arc::clone(&clock)).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Redis not available at redis://127.0.0.1/: {}", e);
            return;
        }
    };

    // Two "processes" configured identically, sharing the store.
    let build = || {
        GovernorBuilder::new()
            .clock(Arc::clone(&clock))
            .store(store.clone())
            .default_rate(Rate::per_minute(4))
            .build()
            .unwrap()
    };
    let node_a = build();
    let node_b = build();

    let ctx = OperationContext::new("orders.list", "GET")
        .caller(CallerContext::anonymous(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))));

    println!("=== Shared limit of 4/minute across two nodes ===\n");
    for call in 1..=6 {
        let (name, node) = if call % 2 == 0 {
            ("b", &node_b)
        } else {
            ("a", &node_a)
        };
        let admission = node.admit(&ctx);
        println!(
            "call {} via node {}: {} (remaining {:?})",
            call,
            name,
            if admission.is_proceed() { "allowed" } else { "rejected" },
            admission.remaining()
        );
    }

    node_a.reset().unwrap();
}
