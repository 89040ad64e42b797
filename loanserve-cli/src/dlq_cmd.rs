use std::io::Write;
use std::io::stdin;
use std::io::stdout;
use std::sync::Arc;

use anyhow::Result;
use anyhow::anyhow;
use loanserve_broker::DlqFilter;
use loanserve_broker::DlqRepublisher;
use loanserve_broker::DlqStore;
use loanserve_broker::InMemoryDlqStore;
use loanserve_broker::dlq;
use uuid::Uuid;

#[derive(Debug, clap::Subcommand)]
pub enum DlqCommand {
    /// Browse parked deliveries without consuming them.
    Inspect {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long = "tenant-id")]
        tenant_id: Option<Uuid>,
    },
    /// Same read path as `inspect`, named for operators used to list-style tooling.
    List {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long = "tenant-id")]
        tenant_id: Option<Uuid>,
    },
    /// Republish a parked delivery with reprocess headers set.
    Reprocess { id: Uuid },
    /// Permanently remove a parked delivery.
    Purge {
        id: Uuid,
        /// Skip the interactive confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Summarize parked deliveries by queue and error prefix.
    Analyze {
        #[arg(long)]
        queue: Option<String>,
    },
}

/// No persistent DLQ backend is wired into this CLI yet — each invocation
/// browses a fresh, empty store. A live deployment would inject a store
/// backed by the broker connection instead of constructing one here.
fn default_store() -> Arc<InMemoryDlqStore> {
    InMemoryDlqStore::shared()
}

struct NullRepublisher;

#[async_trait::async_trait]
impl DlqRepublisher for NullRepublisher {
    async fn republish(&self, _entry: &loanserve_broker::DlqEntry) -> loanserve_broker::DlqResult<()> {
        Err(loanserve_broker::DlqError::Storage(
            "reprocess requires the `lapin-store` feature and a live broker connection".into(),
        ))
    }
}

pub async fn run(command: DlqCommand) -> Result<()> {
    let store = default_store();
    match command {
        DlqCommand::Inspect { queue, tenant_id } | DlqCommand::List { queue, tenant_id } => {
            run_inspect(store.as_ref(), queue, tenant_id).await
        }
        DlqCommand::Reprocess { id } => run_reprocess(store.as_ref(), id).await,
        DlqCommand::Purge { id, yes } => run_purge(store.as_ref(), id, yes).await,
        DlqCommand::Analyze { queue } => run_analyze(store.as_ref(), queue).await,
    }
}

async fn run_inspect(store: &dyn DlqStore, queue: Option<String>, tenant_id: Option<Uuid>) -> Result<()> {
    let entries = dlq::inspect(store, DlqFilter { queue, tenant_id }).await.map_err(|err| anyhow!(err))?;
    if entries.is_empty() {
        println!("No parked deliveries.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{} • {} • retries={} • reprocessed={} • {}",
            entry.id, entry.queue, entry.retry_count, entry.reprocessed, entry.error
        );
    }
    Ok(())
}

async fn run_reprocess(store: &dyn DlqStore, id: Uuid) -> Result<()> {
    let republisher = NullRepublisher;
    let entry = dlq::reprocess(store, &republisher, id).await.map_err(|err| anyhow!(err))?;
    println!("Reprocessed {} (attempt {}).", entry.id, entry.reprocess_count);
    Ok(())
}

async fn run_purge(store: &dyn DlqStore, id: Uuid, yes: bool) -> Result<()> {
    if !yes && !confirm(&format!("Permanently purge parked delivery {id}? [y/N] "))? {
        println!("Aborted.");
        return Ok(());
    }
    dlq::purge(store, id).await.map_err(|err| anyhow!(err))?;
    println!("Purged {id}.");
    Ok(())
}

async fn run_analyze(store: &dyn DlqStore, queue: Option<String>) -> Result<()> {
    let analysis = dlq::analyze(store, DlqFilter { queue, tenant_id: None }).await.map_err(|err| anyhow!(err))?;
    println!("{} parked deliveries ({} reprocessed).", analysis.total, analysis.reprocessed);
    for (queue, count) in &analysis.by_queue {
        println!("  by queue: {queue} = {count}");
    }
    for (prefix, count) in &analysis.by_error_prefix {
        println!("  by error: {prefix} = {count}");
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    stdout().flush()?;
    let mut answer = String::new();
    stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
