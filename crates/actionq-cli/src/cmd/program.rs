use crate::cmd::open_session;
use crate::output::{print_json, print_table};
use actionq_core::{
    display::{program_display, ActionDisplayInfo, DisplayStatus},
    paths, ActionProgram, ActionQueueItem,
};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ProgramSubcommand {
    /// Queue a program from a JSON or YAML file
    Add { file: std::path::PathBuf },
    /// List every queued program
    List,
    /// Show a program's progress step by step
    Show { program_id: String },
    /// Cancel a program; an in-flight step finishes but is discarded
    Cancel { program_id: String },
    /// Remove finished programs from the queue
    Prune,
}

pub fn run(root: &Path, subcmd: ProgramSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ProgramSubcommand::Add { file } => add(root, &file, json),
        ProgramSubcommand::List => list(root, json),
        ProgramSubcommand::Show { program_id } => show(root, &program_id, json),
        ProgramSubcommand::Cancel { program_id } => cancel(root, &program_id, json),
        ProgramSubcommand::Prune => prune(root, json),
    }
}

fn read_program(file: &Path) -> anyhow::Result<ActionProgram> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let is_yaml = matches!(
        file.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let program = if is_yaml {
        serde_yaml::from_str(&data).with_context(|| format!("invalid program {}", file.display()))?
    } else {
        serde_json::from_str(&data).with_context(|| format!("invalid program {}", file.display()))?
    };
    Ok(program)
}

fn add(root: &Path, file: &Path, json: bool) -> anyhow::Result<()> {
    let program = read_program(file)?;
    let program_id = program.program_id.clone();
    let session = open_session(root, &paths::fixture_path(root))?;
    session
        .queue
        .schedule(program, Utc::now())
        .with_context(|| format!("failed to queue program '{program_id}'"))?;

    if json {
        print_json(&serde_json::json!({ "program_id": program_id, "status": "pending" }))?;
    } else {
        println!("Queued program '{program_id}'.");
    }
    Ok(())
}

fn status_label(item: &ActionQueueItem) -> String {
    let info = program_display(&item.program, &item.state);
    match info.status {
        DisplayStatus::Failed(reason) => format!("failed: {reason}"),
        other => other.label().to_string(),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let session = open_session(root, &paths::fixture_path(root))?;
    let mut items: Vec<ActionQueueItem> = session.queue.snapshot().into_values().collect();
    items.sort_by(|a, b| a.program.program_id.cmp(&b.program.program_id));

    if json {
        return print_json(&items);
    }
    if items.is_empty() {
        println!("No programs queued.");
        return Ok(());
    }
    let rows = items
        .iter()
        .map(|item| {
            vec![
                item.program.program_id.clone(),
                item.program.action_op.type_name().to_string(),
                status_label(item),
                item.state
                    .next_execution_time
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "OP", "STATUS", "NEXT CHECK"], rows);
    Ok(())
}

fn show(root: &Path, program_id: &str, json: bool) -> anyhow::Result<()> {
    let session = open_session(root, &paths::fixture_path(root))?;
    let item = session
        .queue
        .get(program_id)
        .with_context(|| format!("program '{program_id}' not found"))?;
    let info = program_display(&item.program, &item.state);

    if json {
        return print_json(&serde_json::json!({ "item": item, "display": info }));
    }
    print_tree(&info, 0);
    Ok(())
}

fn print_tree(info: &ActionDisplayInfo, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}[{}] {}: {}",
        info.status.label(),
        info.title,
        info.message
    );
    for step in &info.steps {
        print_tree(step, depth + 1);
    }
}

fn cancel(root: &Path, program_id: &str, json: bool) -> anyhow::Result<()> {
    let session = open_session(root, &paths::fixture_path(root))?;
    session.queue.cancel(program_id)?;
    if json {
        print_json(&serde_json::json!({ "program_id": program_id, "status": "cancelled" }))?;
    } else {
        println!("Cancelled program '{program_id}'.");
    }
    Ok(())
}

fn prune(root: &Path, json: bool) -> anyhow::Result<()> {
    let session = open_session(root, &paths::fixture_path(root))?;
    let removed = session.queue.prune_done()?;
    if json {
        print_json(&serde_json::json!({ "removed": removed }))?;
    } else {
        println!("Removed {} finished program(s).", removed.len());
    }
    Ok(())
}
