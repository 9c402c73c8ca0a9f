pub mod event;
pub mod init;
pub mod program;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use actionq_core::{
    config::{EngineConfig, WarnLevel},
    db::SharedQueueDb,
    paths,
    simulator::{SimFixture, SimulatedAccount},
    ActionQueue, ActionQueueError, ExecutionContext,
};
use anyhow::Context;

/// An opened queue plus the simulated account driving it.
pub struct Session {
    pub queue: ActionQueue,
    pub account: Arc<SimulatedAccount>,
}

pub fn ensure_initialized(root: &Path) -> anyhow::Result<()> {
    if !paths::is_initialized(root) {
        return Err(ActionQueueError::NotInitialized.into());
    }
    Ok(())
}

/// Load config and fixture, then rehydrate the queue from its database.
///
/// The database is opened per operation, so a running scheduler and other
/// commands can share it.
pub fn open_session(root: &Path, fixture: &Path) -> anyhow::Result<Session> {
    ensure_initialized(root)?;

    let config = EngineConfig::load(root).context("failed to load config.yaml")?;
    for warning in config.validate() {
        match warning.level {
            WarnLevel::Error => tracing::error!("config: {}", warning.message),
            WarnLevel::Warning => tracing::warn!("config: {}", warning.message),
        }
    }

    let sim = if fixture.exists() {
        SimFixture::load(fixture)
            .with_context(|| format!("failed to load fixture {}", fixture.display()))?
    } else {
        SimFixture::default()
    };
    let account = Arc::new(SimulatedAccount::new(sim));

    let db = SharedQueueDb::new(paths::queue_db_path(root));
    let ctx = ExecutionContext::new(account.clone(), config);
    let queue = ActionQueue::from_store(ctx, db).context("failed to load queue")?;
    Ok(Session { queue, account })
}
