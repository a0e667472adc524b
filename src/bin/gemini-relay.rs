use std::path::PathBuf;

use clap::Parser;

use gemini_relay::config::RelayConfig;
use gemini_relay::env::Env;
use gemini_relay::logging::init_tracing;
use gemini_relay::server::{RelayHttpState, router};

#[derive(Debug, Parser)]
#[command(name = "gemini-relay", about = "Streaming Gemini relay with key rotation")]
struct Args {
    /// TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address; overrides the config file and `PORT`.
    #[arg(long)]
    listen: Option<String>,
    /// Directory holding the rotation counter.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Dotenv file consulted before the process environment.
    #[arg(long)]
    dotenv: Option<PathBuf>,
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match args.config.as_deref() {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    config.json_logs |= args.json_logs;

    init_tracing(config.json_logs)?;

    let env = match args.dotenv.as_deref() {
        Some(path) => Env::load_dotenv(path)?,
        None => Env::default(),
    };

    let pool = match config.resolve_pool(&env) {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(error = %err, keys_env = %config.keys_env, "no usable API keys");
            return Err(err.into());
        }
    };
    tracing::info!(keys = pool.len(), rotation = ?config.rotation, "loaded API keys");

    let service = config.build_service(pool)?;
    let state = RelayHttpState::new(service).with_max_body_bytes(config.max_upload_bytes);

    let listen = match args.listen {
        Some(listen) => listen,
        None => config.listen_addr(&env)?,
    };
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "gemini-relay listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
