use crate::cmd::open_session;
use crate::output::print_json;
use actionq_core::paths;
use chrono::Utc;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum EventSubcommand {
    /// Mark an event as fired; programs waiting on it proceed on their next check
    Signal { event_id: String },
}

pub fn run(root: &Path, subcmd: EventSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        EventSubcommand::Signal { event_id } => signal(root, &event_id, json),
    }
}

fn signal(root: &Path, event_id: &str, json: bool) -> anyhow::Result<()> {
    let session = open_session(root, &paths::fixture_path(root))?;
    let fresh = session.queue.signal_event(event_id, Utc::now())?;
    if json {
        print_json(&serde_json::json!({ "event_id": event_id, "first_signal": fresh }))?;
    } else if fresh {
        println!("Signalled event '{event_id}'.");
    } else {
        println!("Event '{event_id}' was already signalled.");
    }
    Ok(())
}
