use discovery::{Config, Discovery};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let app_id = std::env::args().nth(1).unwrap_or_else(|| "example.web".to_string());

    let config = Config::new("127.0.0.1:7171")
        .with_zone("sh1")
        .with_env("test");
    let client = Discovery::new(config)?;

    let mut events = client.watch(&app_id).await;
    info!("watching {}", app_id);

    // wake-ups coalesce: every event means "re-fetch", not "one change"
    while events.changed().await.is_ok() {
        match client.fetch(&app_id) {
            Some(zones) => {
                for (zone, instances) in zones.iter() {
                    info!("{}: {} instance(s) in zone {}", app_id, instances.len(), zone);
                    for instance in instances {
                        info!("  {} {:?} color({})", instance.hostname, instance.addrs, instance.color);
                    }
                }
            }
            None => info!("{}: no snapshot yet", app_id),
        }
    }
    Ok(())
}
