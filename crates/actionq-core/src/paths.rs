use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const ACTIONQ_DIR: &str = ".actionq";
pub const CONFIG_FILE: &str = ".actionq/config.yaml";
pub const QUEUE_DB_FILE: &str = ".actionq/queue.db";
pub const FIXTURE_FILE: &str = ".actionq/fixture.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn actionq_dir(root: &Path) -> PathBuf {
    root.join(ACTIONQ_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn queue_db_path(root: &Path) -> PathBuf {
    root.join(QUEUE_DB_FILE)
}

pub fn fixture_path(root: &Path) -> PathBuf {
    root.join(FIXTURE_FILE)
}

pub fn is_initialized(root: &Path) -> bool {
    actionq_dir(root).is_dir()
}
