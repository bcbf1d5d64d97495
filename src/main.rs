//! Demo entry point
//!
//! Runs a sign-in / profile update / sign-out scenario against the in-memory
//! provider and store, logging every state transition.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use session_lifecycle::{
    InMemoryIdentityProvider, InMemoryProfileStore, ManagerConfig, Profile, ProfilePatch, Role,
    SessionManager, SessionStatus,
};

#[derive(Parser, Debug)]
#[command(
    name = "session-lifecycle",
    version,
    about = "Drive the session lifecycle manager against in-memory backends"
)]
struct Args {
    /// TOML file with manager settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Identifier to sign in with
    #[arg(long, default_value = "a@b.com")]
    identifier: String,

    /// Secret to sign in with
    #[arg(long, default_value = "pw")]
    secret: String,

    /// Artificial latency of every profile store call
    #[arg(long, default_value_t = 50)]
    profile_latency_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ManagerConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ManagerConfig::default(),
    };

    let provider = Arc::new(InMemoryIdentityProvider::new().with_account("a@b.com", "pw", "u1"));
    let store = Arc::new(
        InMemoryProfileStore::new()
            .with_profile(Profile::new("u1", "Ada Lovelace").with_role(Role::Student)),
    );
    store.set_latency(Some(Duration::from_millis(args.profile_latency_ms)));

    let manager = SessionManager::start(provider, store, config)
        .await
        .context("invalid manager config")?;
    let _listener = manager.on_change(|state| {
        info!(
            "state: {} (generation {}, user {})",
            state.status,
            state.generation,
            state.user_id().unwrap_or("-")
        );
    });

    let session = manager
        .sign_in(&args.identifier, &args.secret)
        .await
        .context("sign-in failed")?;
    info!("sign-in returned session for {}", session.user_id);

    let wait = manager.config().profile_load_timeout() + Duration::from_secs(1);
    let state = tokio::time::timeout(
        wait,
        manager.wait_for(|s| matches!(s.status, SessionStatus::Ready | SessionStatus::Error)),
    )
    .await
    .context("profile did not load in time")?;
    if let Some(err) = state.error {
        bail!("profile load failed: {}", err);
    }

    let updated = manager
        .update_profile(ProfilePatch::new().set("timezone", "UTC"))
        .await
        .context("profile update failed")?;
    info!("profile updated: {}", serde_json::to_string(&updated)?);

    manager.sign_out().await.context("sign-out failed")?;
    info!("authenticated after sign-out: {}", manager.is_authenticated());

    manager.shutdown();
    Ok(())
}
