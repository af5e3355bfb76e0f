use std::path::PathBuf;

use anyhow::{Context, Result};
use astm_lis_gateway::config::GatewayConfig;
use astm_lis_gateway::gateway::Gateway;
use log::{error, info};

/// Load `GatewayConfig` from the path in `ASTM_GATEWAY_CONFIG`, or fall back
/// to a single default instrument on port 5600 (§6 "process bootstrap/CLI
/// ... out of scope" for the core; this is the thinnest bootstrap that
/// satisfies it, mirroring the teacher's `create_default_meril_analyzer`
/// fallback).
fn load_config() -> Result<GatewayConfig> {
    match std::env::var_os("ASTM_GATEWAY_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let config: GatewayConfig = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse config file {}", path.display()))?;
            config.validate().map_err(anyhow::Error::msg)?;
            Ok(config)
        }
        None => Ok(GatewayConfig::default_single_instrument("DEFAULT", 5600)),
    }
}

fn main() -> std::process::ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to build tokio runtime: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let config = match load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let handle = runtime.handle().clone();
    let gateway = match runtime.block_on(Gateway::initialize(config, handle.clone())) {
        Ok(g) => g,
        Err(e) => {
            error!("failed to initialize gateway: {e:#}");
            return std::process::ExitCode::FAILURE;
        }
    };

    gateway.run(&handle);
    info!("gateway started, press Ctrl-C to stop");

    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        error!("failed to listen for shutdown signal: {e}");
    }

    info!("shutting down");
    gateway.shutdown();
    std::process::ExitCode::SUCCESS
}
