pub mod codec;
pub mod config;
pub mod context;
pub mod core;
pub mod db;
pub mod driver;
pub mod error;
pub mod events;
pub mod instance;
pub mod log;
pub mod rpc;
pub mod services;

use anyhow::Context;

use config::Settings;
use context::{AppContext, Role};
use services::BackgroundServices;

pub fn run() -> anyhow::Result<()> {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in guardplane: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guardplane_lib=info".into()),
        )
        .init();

    let settings = Settings::load().context("failed to load settings")?;
    tracing::info!("Runtime directory {}", settings.runtime_dir.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config::WORKER_POOL_SIZE)
        .thread_name("guardplane-worker")
        .build()
        .context("failed to build the async runtime")?;

    runtime.block_on(async {
        let (context, launch) = AppContext::start(settings).await?;
        let services = BackgroundServices::start(launch);
        match context.role {
            Role::Master => tracing::info!("guardplane master started"),
            Role::Client => tracing::info!("guardplane client started"),
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("Shutdown requested");
        services.shutdown().await;
        drop(context);
        Ok::<(), anyhow::Error>(())
    })
}
