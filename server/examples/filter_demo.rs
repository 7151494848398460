use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gatelink_client::FilterClient;
use gatelink_common::config;
use gatelink_common::filter::{
    Application, FilterMode, PacketBatch, PacketInfo, Permission, Rule, DIRECTION_OUTGOING,
};
use gatelink_server::FilterService;
use tracing::info;

/// In-process demo: the filtering service and a client talking to it over
/// the port substrate, with rule pushes and access checks flowing both ways.
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== Gatelink Filter Demo ===");

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let service_name = config::service_name();
    let mut service =
        FilterService::new(&service_name).context("Failed to register filtering service")?;
    service.start();
    println!("✓ Service registered as {service_name}");

    let mut client = FilterClient::connect(
        &service_name,
        FilterMode::Wait,
        vec![Rule {
            id: 0,
            permission: Permission::Allow,
            application: Application::new("/bin/ls"),
            last_access: None,
            access_count: 0,
        }],
    )
    .context("Failed to connect client")?;
    println!("✓ Client connected, mode: {:?}", client.mode()?);

    client.on_rules_changed(|update| {
        info!(full = update.is_full(), "rules changed");
    });
    client.on_access_check(|application| {
        info!(path = %application.path, "access check");
        if application.path.starts_with("/usr/") {
            Permission::Allow
        } else {
            Permission::Deny
        }
    });

    client.add_rule_for_application("/usr/bin/curl")?;
    client.ping()?;

    while !service.has_listener() {
        std::thread::sleep(Duration::from_millis(10));
    }

    for path in ["/usr/bin/ssh", "/tmp/unknown-tool"] {
        let verdict = service.check_access(&Application::new(path)).wait()?;
        println!("  access {path}: {verdict:?}");
    }

    client.enable_statistics(config::DEFAULT_FLOW_BUFFER_BYTES, |batch| {
        info!(packets = batch.packet_count(), "statistics batch received");
    })?;
    while service.statistics_flow_bytes().is_none() {
        std::thread::sleep(Duration::from_millis(10));
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);
    service
        .push_packets(&PacketBatch {
            entries: vec![(
                Application::new("/usr/bin/ssh"),
                vec![PacketInfo {
                    size: 1500,
                    direction: DIRECTION_OUTGOING,
                    timestamp: now,
                }],
            )],
        })
        .wait()?;

    println!("Current rules:");
    for rule in service.rules() {
        println!(
            "  #{} {:?} {} (accessed {} times)",
            rule.id, rule.permission, rule.application.path, rule.access_count
        );
    }

    println!("Press Ctrl+C to stop");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    service.stop();
    println!("Service stopped");
    Ok(())
}
