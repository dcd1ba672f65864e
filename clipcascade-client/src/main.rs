use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use clipcascade_client::{
    ClientConfig, ConfigError, SessionError, SessionSupervisor,
    clipboard::{ArboardClipboard, ClipboardCollector},
    collab::notifier_for,
    config::default_config_path,
    logging::init_logging,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "clipcascade", about = "Headless ClipCascade clipboard sync client")]
struct ClientArgs {
    /// Config file; defaults to config.json in the data directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Environment variable holding the password used to derive the
    /// encryption key when none is stored yet.
    #[arg(long)]
    password_env: Option<String>,
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = ClientArgs::parse();
    if let Err(err) = run(args).await {
        error!("clipcascade stopped: {}", err);
        eprintln!("clipcascade: {err}");
        std::process::exit(1);
    }
}

async fn run(args: ClientArgs) -> Result<(), SessionError> {
    let path = args.config.unwrap_or_else(default_config_path);
    let mut config = match ClientConfig::load(&path)? {
        Some(config) => config,
        None => {
            let config = ClientConfig::default();
            config.save(&path)?;
            info!(path = %path.display(), "wrote default config");
            config
        }
    };

    if config.cipher_enabled && config.key().is_none() {
        let var = args.password_env.ok_or_else(|| {
            ConfigError::Invalid(vec![
                "Encryption is enabled but no key is stored; pass --password-env.".to_owned(),
            ])
        })?;
        let password = std::env::var(&var).map_err(|_| {
            ConfigError::Invalid(vec![format!("Environment variable {var} is not set.")])
        })?;
        config.derive_and_store_key(&password)?;
        config.save(&path)?;
        info!("derived and stored encryption key");
    }

    let supervisor = SessionSupervisor::from_config(
        &config,
        Arc::new(ArboardClipboard),
        notifier_for(config.notification),
    )?;
    supervisor.connect().await?;
    info!(stats = %supervisor.get_stats(), "clipboard sync running");

    let sender = supervisor.clone();
    let mut collector = ClipboardCollector::start(
        Duration::from_millis(args.poll_interval_ms.max(50)),
        move |event| sender.on_clipboard_changed(event),
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to wait for Ctrl-C: {}", err);
    }
    info!("shutting down");

    let _ = tokio::task::spawn_blocking(move || collector.stop()).await;
    supervisor.disconnect().await;
    Ok(())
}
