use std::time::Duration;

use clap::Parser;
use console_tokens::{
    ClientId, ClientSecret, ConsoleTokenManager, Credentials, ManagerConfig, TokenState,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The console API base URL
    #[arg(long, env = "CONSOLE_ENDPOINT")]
    console_endpoint: String,

    /// The portal's OAuth2 token URL
    #[arg(short, long, env = "PORTAL_AUTHORIZATION_ENDPOINT")]
    authorization_endpoint: String,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the portal
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// The scope to request
    #[arg(long, default_value = "system")]
    scope: String,

    /// Seconds between token requests
    #[arg(short, long, default_value_t = 30)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let credentials = Credentials::builder()
        .console_endpoint(opts.console_endpoint)
        .authorization_endpoint(opts.authorization_endpoint)
        .client_id(opts.client_id)
        .client_secret(opts.client_secret)
        .build()?;

    let manager = ConsoleTokenManager::with_config(
        credentials,
        ManagerConfig::default().with_scope(opts.scope),
    );

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        let before = manager.token_state();
        match manager.access_token().await {
            Ok(token) => {
                let state = manager.token_state();
                if before == TokenState::Valid {
                    tracing::debug!(?state, "reused cached token");
                } else {
                    tracing::info!(
                        ?before,
                        ?state,
                        token = format_args!("{:#?}", token),
                        "obtained access token"
                    );
                }
            }
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "unable to obtain access token"
                );
            }
        }
    }
}
