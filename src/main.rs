use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tka::config::{has_flag, ServerConfig, USAGE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    // Init logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(target: "tka", "tka-server {} starting: RUST_LOG='{}'", env!("CARGO_PKG_VERSION"), rust_log);

    let config = ServerConfig::from_env_and_args(&args)?;
    tka::server::run_with_config(config).await
}
