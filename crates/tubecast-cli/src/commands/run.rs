//! `tubecast run`: start the engine and block until shutdown.

use std::sync::Arc;

use clap::Args;
use console::style;
use tubecast_core::cache::MemoryCache;
use tubecast_core::config::Config;
use tubecast_core::content::CommentComposer;
use tubecast_core::engine::{Engine, EngineContext, UsageTracker};
use tubecast_core::llm::{self, LlmProvider};
use tubecast_core::queue::JobQueue;
use tubecast_core::storage;
use tubecast_core::upstream::{PlatformClient, TokenEndpoint};

/// Arguments for `tubecast run`.
#[derive(Args)]
pub struct RunArgs {}

/// Wire up the engine from configuration and run until Ctrl+C/SIGTERM.
pub async fn execute(_args: &RunArgs, config: Config) -> anyhow::Result<()> {
    let workers = config.queue.schedule_concurrency
        + config.queue.post_concurrency
        + config.queue.view_concurrency;
    let db = storage::init_db(
        &config.database.path,
        storage::pool_size_for_workers(workers),
    )
    .await?;

    let llm_provider: Option<Arc<dyn LlmProvider>> = llm::provider_from_config(&config.llm)
        .map(|provider| Arc::new(provider) as Arc<dyn LlmProvider>);
    if llm_provider.is_none() {
        tracing::info!("No LLM API key configured; AI comment synthesis disabled");
    }

    let ctx = EngineContext {
        queue: JobQueue::new(db.clone()),
        db,
        cache: Arc::new(MemoryCache::new()),
        platform: Arc::new(PlatformClient::new()),
        composer: Arc::new(CommentComposer::new(llm_provider)),
        tracker: Arc::new(UsageTracker::new()),
        token_endpoint: TokenEndpoint::default(),
        viewer: None,
        config,
    };

    let mut engine = Engine::new(ctx);
    engine.start().await?;

    println!(
        "{} engine running, press Ctrl+C to stop",
        style("✓").green()
    );
    engine.run_until_shutdown().await;
    Ok(())
}
