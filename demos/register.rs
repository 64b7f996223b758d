use discovery::{Config, Discovery, Instance};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Configure the client; zone/env/host fall back to ZONE, DEPLOY_ENV
    // and the OS hostname when unset
    let config = Config::new("127.0.0.1:7171")
        .with_zone("sh1")
        .with_env("test");
    let client = Discovery::new(config)?;

    let instance = Instance::new("example.web")
        .with_addr("http://127.0.0.1:8080")
        .with_addr("grpc://127.0.0.1:8081")
        .with_color("red")
        .with_version("1.0")
        .with_metadata("weight", "10");

    info!("registering {}", instance.app_id);
    let registration = client.register(instance).await?;
    info!("registered; renewing every 30s, ctrl-c to deregister");

    tokio::signal::ctrl_c().await?;

    // ordered teardown: stops renewing, posts the cancellation, then
    // returns
    registration.cancel().await;
    client.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("deregistered");
    Ok(())
}
