use std::path::{Path, PathBuf};

use actionq_core::paths;

/// Resolve the data root.
///
/// Priority:
/// 1. `--root` flag / `ACTIONQ_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.actionq/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_root_from(&cwd).unwrap_or(cwd)
}

fn find_root_from(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| paths::is_initialized(dir))
        .map(Path::to_path_buf)
}
