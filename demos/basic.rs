//! Basic example: one governed endpoint with a rate limit and idempotency.
//!
//! A client creates an order three times with the same idempotency key,
//! then hammers a listing endpoint limited to 3 calls per minute.

use request_governance::{
    Admission, CallerContext, EventFilter, GovernorBuilder, Handler, KeyStrategy,
    OperationContext, Rate, RouteLimit,
};
use std::net::{IpAddr, Ipv4Addr};
use tracing_subscriber::prelude::*;

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let governor = GovernorBuilder::new()
        .default_rate(Rate::per_minute(3))
        .route(
            "orders.create",
            RouteLimit::rate(Rate::per_minute(10)).with_key(KeyStrategy::User),
        )
        .build()
        .unwrap();

    // Collaborators (logging, metrics, audit) observe through the bus.
    governor.events().unwrap().subscribe(
        EventFilter::Any,
        Handler::sync(|event| {
            println!("  event: {} {:?}", event.event_type, event.payload);
            Ok(())
        }),
    );

    let caller = CallerContext::user(Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))), "alice");

    println!("=== Idempotent order creation ===\n");
    let create = OperationContext::new("orders.create", "POST")
        .caller(caller.clone())
        .idempotency_token("order-42");
    for attempt in 1..=3 {
        println!("attempt {}:", attempt);
        match governor.admit(&create) {
            Admission::Proceed(permit) => {
                let response = br#"{"id":7,"status":"created"}"#;
                governor.complete(permit, response).unwrap();
                println!("  executed, stored response");
            }
            Admission::Replayed(body) => {
                println!("  replayed: {}", String::from_utf8_lossy(&body));
            }
            other => println!("  refused: {:?}", other),
        }
    }

    println!("\n=== Rate limited listing (3/minute) ===\n");
    let list = OperationContext::new("orders.list", "GET").caller(caller);
    for call in 1..=5 {
        let admission = governor.admit(&list);
        println!(
            "call {}: {} (remaining {:?})",
            call,
            if admission.is_proceed() { "allowed" } else { "rejected" },
            admission.remaining()
        );
        if let Some(permit) = admission.into_permit() {
            governor.complete(permit, b"[]").unwrap();
        }
    }

    let metrics = governor.metrics().snapshot();
    println!("\n=== Metrics ===");
    println!("{:#?}", metrics);
    println!("rejection rate: {:.0}%", metrics.rejection_rate() * 100.0);
}
