//! Basic command usage example

use command_machines::{CommandConfig, CommandError, CommandRegistry, Dependency, EventType};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Command Basic Example ===\n");

    let payments = Dependency::builder("payment_api")
        .volume_threshold(3)
        .error_threshold_percentage(50)
        .sleep_window_ms(500)
        .execution_timeout_ms(100)
        .rolling_window(1_000, 10)
        .drive_metrics(true)
        .on_open(|t| println!("🔴 Circuit '{}' opened!", t.command_key))
        .on_close(|t| println!("🟢 Circuit '{}' closed!", t.command_key))
        .on_half_open(|t| println!("🟡 Circuit '{}' half-open, testing...", t.command_key))
        .build()
        .expect("failed to build dependency");

    println!("Initial state: {}\n", payments.circuit_state().as_str());

    println!("--- Successful calls ---");
    for i in 1..=2 {
        match payments.execute(move || Ok(format!("Payment {i}"))) {
            Ok(result) => println!("✓ {result}"),
            Err(e) => println!("✗ Error: {e}"),
        }
    }

    println!("\n--- Triggering failures ---");
    for i in 1..=4 {
        let outcome = payments
            .submit(
                move || Err(format!("Payment failed {i}").into()),
                |cause: &CommandError| Ok(format!("fallback after {}", cause.event_type().map_or("error", |e| e.as_str()))),
            )
            .and_then(|handle| handle.wait());
        match outcome {
            Ok(result) => println!("✓ {result}"),
            Err(e) => println!("✗ {e}"),
        }
    }

    println!("\n--- Timeout ---");
    let slow = payments.submit(
        || {
            std::thread::sleep(Duration::from_millis(300));
            Ok("slow payment".to_string())
        },
        |_| Ok("timed out, using cached receipt".to_string()),
    );
    match slow.and_then(|handle| handle.wait()) {
        Ok(result) => println!("✓ {result}"),
        Err(e) => println!("✗ {e}"),
    }

    // Let the driver close the window
    std::thread::sleep(Duration::from_millis(1_100));
    let health = payments.health_counts();
    println!(
        "\nHealth: {} requests, {} errors ({}%)",
        health.total_requests(),
        health.error_count(),
        health.error_percentage()
    );

    println!("\n--- Attempting call while open ---");
    match payments.execute(|| Ok("Should be rejected".to_string())) {
        Ok(result) => println!("✓ {result}"),
        Err(e) => println!("✗ {e}"),
    }
    println!("State: {}", payments.circuit_state().as_str());

    println!("\n--- Probe after sleep window ---");
    std::thread::sleep(Duration::from_millis(600));
    match payments.execute(|| Ok("Payment successful".to_string())) {
        Ok(result) => println!("✓ {result}"),
        Err(e) => println!("✗ {e}"),
    }
    println!("State: {}", payments.circuit_state().as_str());

    println!(
        "\nRolling: {} success, {} failure, {} timeout, {} short-circuited",
        payments.rolling_count(EventType::Success),
        payments.rolling_count(EventType::Failure),
        payments.rolling_count(EventType::Timeout),
        payments.rolling_count(EventType::ShortCircuited),
    );
    payments.shutdown();

    println!("\n--- Registry ---");
    let registry = CommandRegistry::new().expect("failed to start registry");
    let config = CommandConfig::default();
    for user in ["alice", "bob"] {
        let greeting = registry
            .submit("profiles", &config, move || Ok(format!("profile of {user}")), |_| {
                Ok("anonymous profile".to_string())
            })
            .and_then(|handle| handle.wait());
        match greeting {
            Ok(result) => println!("✓ {result}"),
            Err(e) => println!("✗ {e}"),
        }
    }
    println!("Registered dependencies: {:?}", registry.keys());
}
