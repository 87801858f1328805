use anyhow::Result;
use clap::Parser;

use vidhubcontrol::DeviceService;
use vidhubcontrol::actions::Action;
use vidhubcontrol::config::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logger, defaulting to info
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServiceConfig::parse();

    if config.print_schema {
        let schema = schemars::schema_for!(Action);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    log::info!("Starting vidhubcontrol");
    log::info!("Device: {:?} at {}", config.device, config.host);

    let service = DeviceService::new(config);
    service.start().await?;

    Ok(())
}
