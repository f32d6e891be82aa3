use anyhow::Result;
use clap::{Parser, Subcommand};
use gatekit::auth::{AuthClaims, KeyRing, generate_api_key};
use gatekit::config::{GatekitConfig, resolve_config_path};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gatekit")]
#[command(about = "Token and API key gatekeeping for HTTP endpoints")]
struct Cli {
    /// Config file (defaults to $GATEKIT_CONFIG, the XDG config dir, then ./gatekit.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Signing key; repeat to configure several. Replaces the configured keys.
    #[arg(long = "key", env = "GATEKIT_KEYS", value_delimiter = ',', global = true)]
    keys: Vec<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign a token with one of the active keys
    IssueToken {
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "")]
        username: String,
        #[arg(long, default_value_t = false)]
        admin: bool,
        /// Lifetime in seconds (defaults to token_ttl_seconds from the config)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Validate a token and print its claims
    VerifyToken { token: String },
    /// Generate a new API key and the hash to put in a key store
    GenerateApiKey,
    /// Run the demo HTTP server
    Serve {
        /// Bind address, e.g. 0.0.0.0:8080
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gatekit=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::IssueToken {
            subject,
            username,
            admin,
            ttl,
        } => {
            let mut cfg = load_config(cli.config, cli.keys)?;
            if let Some(ttl) = ttl {
                cfg.token_ttl_seconds = ttl;
            }
            let codec = cfg.token_codec()?;
            let keys = cfg.key_registry()?;

            let token = codec.create_token(
                || {
                    cfg.issue_claims(&subject)
                        .with_username(username)
                        .with_admin(admin)
                },
                &keys,
            )?;
            println!("{}", token);
        }
        Commands::VerifyToken { token } => {
            let cfg = load_config(cli.config, cli.keys)?;
            let codec = cfg.token_codec()?;
            let keys = cfg.key_registry()?;

            let claims: AuthClaims = codec.validate(&token, &keys)?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
        Commands::GenerateApiKey => {
            let (key, hash) = generate_api_key();

            println!("API key generated.");
            println!();
            println!("  Key:     {}", key);
            println!("  SHA-256: {}", hash);
            println!();
            println!("IMPORTANT: Save this key now. It cannot be recovered from the hash.");
            println!("Use with: -H 'X-Api-Key: {}'", key);
        }
        Commands::Serve { bind } => {
            let cfg = load_config(cli.config, cli.keys)?;
            let keys = Arc::new(KeyRing::new(cfg.key_registry()?));
            let app = gatekit::api::create_public_router(&cfg, keys)?;

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("gatekit listening on http://{}", bind);

            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

/// Load the config file and apply command-line key overrides. Without a
/// config file, keys given on the command line are enough.
fn load_config(path: Option<PathBuf>, keys: Vec<String>) -> Result<GatekitConfig> {
    let mut cfg = match path {
        Some(path) => GatekitConfig::from_path(&path)?,
        None => match resolve_config_path() {
            Ok(path) => GatekitConfig::from_path(&path)?,
            Err(err) if !keys.is_empty() => {
                debug!("no config file, using command-line keys: {}", err);
                GatekitConfig::default()
            }
            Err(err) => return Err(err),
        },
    };

    if !keys.is_empty() {
        cfg.keys = keys;
        cfg.retired_keys.clear();
    }
    if cfg.keys.is_empty() {
        anyhow::bail!("no signing keys configured (add `keys` to the config file or pass --key)");
    }

    Ok(cfg)
}
