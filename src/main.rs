//! Service entrypoint: loads configuration from the path given as the first
//! CLI argument, initializes structured logging, and runs the engine until
//! shutdown.

use task::labels::ProcessLabels;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: qoe-telemetryd <config.yaml>");
            std::process::exit(2);
        }
    };

    let app_config = match config::AppConfig::load(&config_path) {
        Ok(app_config) => app_config,
        Err(err) => {
            eprintln!("failed to load configuration from '{config_path}': {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(app_config.log_filter.clone()))
        .init();

    let process_labels = ProcessLabels::new("qoe-telemetryd");

    if let Err(err) = engine::run(app_config, process_labels).await {
        tracing::error!(error = %err, "engine exited with an error");
        std::process::exit(1);
    }
}
