use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let http_port = std::env::var("ECHOFILES_HTTP_PORT").unwrap_or_else(|_| "7878".to_string());
    let data_root = std::env::var("ECHOFILES_DATA_ROOT").unwrap_or_else(|_| "data".to_string());
    let persist = std::env::var("ECHOFILES_PERSIST").unwrap_or_else(|_| "false".to_string());
    let config = std::env::var("ECHOFILES_CONFIG").unwrap_or_else(|_| "<none>".to_string());
    info!(
        target: "startup",
        "echofiles starting: RUST_LOG='{}', http_port={}, data_root='{}', persist={}, config='{}'",
        rust_log, http_port, data_root, persist, config
    );

    echofiles::server::run().await
}
