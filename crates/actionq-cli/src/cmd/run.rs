use crate::cmd::{open_session, Session};
use crate::output::{print_json, print_table};
use actionq_core::{paths, TickOutcome};
use anyhow::Context;
use chrono::Utc;
use std::path::Path;
use tokio::sync::{broadcast::error::RecvError, watch};

pub fn run(root: &Path, once: bool, fixture: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let fixture = fixture
        .map(Path::to_path_buf)
        .unwrap_or_else(|| paths::fixture_path(root));
    let session = open_session(root, &fixture)?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        if once {
            tick_once(&session, json).await
        } else {
            run_until_interrupted(&session).await
        }
    });

    // Persist simulated balances and confirmations even if the loop failed.
    session
        .account
        .snapshot()
        .save(&fixture)
        .with_context(|| format!("failed to write fixture {}", fixture.display()))?;
    result
}

async fn tick_once(session: &Session, json: bool) -> anyhow::Result<()> {
    let outcomes = session.queue.run_once(Utc::now()).await?;

    if json {
        let rows: Vec<serde_json::Value> = outcomes
            .iter()
            .map(|(program_id, outcome)| {
                serde_json::json!({ "program_id": program_id, "result": outcome })
            })
            .collect();
        return print_json(&rows);
    }
    if outcomes.is_empty() {
        println!("Nothing due.");
        return Ok(());
    }
    let rows = outcomes
        .iter()
        .map(|(program_id, outcome)| vec![program_id.clone(), describe(*outcome).to_string()])
        .collect();
    print_table(&["PROGRAM", "RESULT"], rows);
    Ok(())
}

fn describe(outcome: TickOutcome) -> &'static str {
    match outcome {
        TickOutcome::Skipped => "skipped",
        TickOutcome::Deferred => "deferred",
        TickOutcome::Executed => "executed",
        TickOutcome::Polled { effective: true } => "effective",
        TickOutcome::Polled { effective: false } => "waiting",
        TickOutcome::Completed => "completed",
    }
}

async fn run_until_interrupted(session: &Session) -> anyhow::Result<()> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    let mut events = session.queue.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    session.queue.run(rx).await;
    printer.abort();
    Ok(())
}
