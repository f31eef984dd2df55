//! Sync subcommand: manual syncs, host triggers and queue processing.

use clap::Subcommand;
use fieldbridge_core::{Disposition, SyncEvent, SyncOutcome};

use super::{runtime, CliResult, Context};

/// Sync actions.
#[derive(Subcommand)]
pub enum SyncAction {
    /// Sync one record now
    Record {
        id: u64,
        /// JSON export to read records from
        #[arg(long)]
        records: Option<String>,
    },
    /// Report a host save or field change; the sync is queued
    Trigger {
        id: u64,
        /// Record type
        #[arg(long, default_value = "post")]
        r#type: String,
        /// Changed field, for field-change events
        #[arg(long)]
        field: Option<String>,
        #[arg(long)]
        records: Option<String>,
    },
    /// Process queued syncs that are due
    Run {
        /// Maximum records to process
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        records: Option<String>,
    },
    /// Show the sync state of a record
    Status {
        id: u64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Run the sync command.
pub fn run(action: SyncAction) -> CliResult {
    let ctx = Context::open()?;
    let mut orch = ctx.orchestrator()?;

    match action {
        SyncAction::Record { id, records } => {
            let source = ctx.source(records.as_deref())?;
            let report = runtime()?.block_on(orch.sync_now(id, &source))?;
            match report.outcome {
                SyncOutcome::Synced { .. } | SyncOutcome::Retrying { .. } => {
                    println!("{}", report.message)
                }
                _ => return Err(report.message.into()),
            }
        }
        SyncAction::Trigger {
            id,
            r#type,
            field,
            records,
        } => {
            let source = ctx.source(records.as_deref())?;
            let event = match field {
                Some(field) => SyncEvent::field_changed(id, r#type, field),
                None => SyncEvent::save(id, r#type),
            };
            match runtime()?.block_on(orch.handle_event(&event, &source))? {
                Disposition::Queued { due_at } => {
                    println!("queued, due {}", due_at.format("%H:%M:%S"))
                }
                Disposition::Coalesced { due_at } => {
                    println!("merged with pending sync, due {}", due_at.format("%H:%M:%S"))
                }
                Disposition::Ignored { reason } => println!("ignored: {reason}"),
                Disposition::Completed(report) => println!("{}", report.message),
            }
        }
        SyncAction::Run { limit, records } => {
            if orch.queue().is_empty() {
                println!("queue is empty");
                return Ok(());
            }
            let source = ctx.source(records.as_deref())?;
            let reports = runtime()?.block_on(orch.process_pending(&source, limit))?;
            if reports.is_empty() {
                if let Some(next) = orch.queue().next_due() {
                    println!("nothing due yet; next sync at {}", next.format("%H:%M:%S"));
                }
            }
            for report in &reports {
                println!("{}", report.message);
            }
            if !orch.queue().is_empty() {
                println!("{} sync(s) still queued", orch.queue().len());
            }
        }
        SyncAction::Status { id, json } => {
            let state = orch.sync_state(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
                return Ok(());
            }
            let Some(state) = state else {
                println!("record {id} has never been synced");
                return Ok(());
            };
            println!("Record:      {}", state.record_id);
            println!("Status:      {}", state.last_sync_status);
            if let Some(remote_id) = &state.remote_id {
                println!("Remote id:   {remote_id}");
            }
            if let Some(at) = state.last_synced_at {
                println!("Last synced: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if let Some(reason) = &state.pending_reason {
                println!("Pending:     {reason}");
            }
            if let Some(error) = &state.last_error {
                println!("Last error:  {error}");
            }
            if let Some(pending) = orch.queue().get(id) {
                println!(
                    "Queued:      due {} (attempt {})",
                    pending.due_at.format("%H:%M:%S"),
                    pending.attempts + 1
                );
            }
        }
    }
    Ok(())
}
