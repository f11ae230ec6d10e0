use anyhow::Result;
use courier_telemetry::install as init_telemetry;

use courier_gateway::{config::GatewayConfig, run};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("courier-gateway")?;

    let config = GatewayConfig::from_env()?;
    run(config).await
}
