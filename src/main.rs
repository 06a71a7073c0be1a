use clap::Parser;
use envkit::{settings, storage, web};
use miette::Result;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "envkit",
    version,
    about = "EnvKit environment variable manager backend"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(
        host = %settings.server.host,
        port = settings.server.port,
        base_url = %settings.base_url(),
        database = %settings.database.redacted_url(),
        pending_ttl_secs = settings.pairing.pending_ttl_secs,
        session_ttl_secs = settings.pairing.session_ttl_secs,
        cli_host = %settings.bridge.cli_host,
        "Loaded configuration"
    );

    // init storage (database + migrations)
    let db = storage::init(&settings.database).await?;

    // start web server
    web::serve(settings, db).await?;
    Ok(())
}
