use clap::Parser;
use ledgerbus::env::{Env, setup_tracing};
use ledgerbus::launch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Env::parse().into_config()?;

    let telemetry_guard = if let Some(ref otlp) = config.otlp {
        match otlp.setup_telemetry() {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Failed to setup telemetry: {e}");
                setup_tracing(&config.log_level);
                None
            }
        }
    } else {
        setup_tracing(&config.log_level);
        None
    };

    let result = launch(config).await;

    // Drop the guard before returning so pending spans are flushed and the
    // exporter's background threads terminate cleanly.
    drop(telemetry_guard);

    result
}
