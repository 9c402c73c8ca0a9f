use actionq_core::{
    config::EngineConfig, db::ActionQueueDb, io, paths, simulator::SimFixture,
};
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing actionq in: {}", root.display());

    let dir = paths::actionq_dir(root);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = paths::config_path(root);
    if !config_path.exists() {
        EngineConfig::default()
            .save(root)
            .context("failed to write config.yaml")?;
        report(paths::CONFIG_FILE, true);
    } else {
        report(paths::CONFIG_FILE, false);
    }

    let fixture = serde_yaml::to_string(&SimFixture::sample())?;
    report(
        paths::FIXTURE_FILE,
        io::write_if_missing(&paths::fixture_path(root), fixture.as_bytes())
            .context("failed to write fixture.yaml")?,
    );

    let db_path = paths::queue_db_path(root);
    let existed = db_path.exists();
    ActionQueueDb::open(&db_path).context("failed to create queue db")?;
    report(paths::QUEUE_DB_FILE, !existed);

    Ok(())
}

fn report(file: &str, created: bool) {
    if created {
        println!("  created: {file}");
    } else {
        println!("  exists:  {file}");
    }
}
