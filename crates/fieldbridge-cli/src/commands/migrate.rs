//! Migrate subcommand: full backfill of existing records.

use clap::Subcommand;
use fieldbridge_core::migration::{self, MigrationOptions, MigrationRun, MigrationState};

use super::{runtime, CliResult, Context};

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Push every record of a type to the CRM, resuming an unfinished run
    Run {
        #[arg(long, default_value = "post")]
        r#type: String,
        /// Records per page (defaults to migration.page_size)
        #[arg(long)]
        page_size: Option<usize>,
        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        records: Option<String>,
    },
    /// Show stored progress
    Status {
        #[arg(long, default_value = "post")]
        r#type: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget stored progress so the next run starts over
    Reset {
        #[arg(long, default_value = "post")]
        r#type: String,
    },
}

fn print_state(state: &MigrationState) {
    let summary = state.summary();
    let phase = if state.is_complete() {
        "complete"
    } else if state.halted_reason.is_some() {
        "halted"
    } else {
        "in progress"
    };
    println!("Record type: {}", state.record_type);
    println!("State:       {phase}");
    println!("Started:     {}", state.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(at) = state.completed_at {
        println!("Completed:   {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(cursor) = state.cursor {
        println!("Cursor:      {cursor}");
    }
    if let Some(reason) = &state.halted_reason {
        println!("Halted:      {reason}");
    }
    println!(
        "Processed:   {} ({} synced, {} failed, {} ineligible, {} re-queued)",
        summary.processed, summary.succeeded, summary.failed, summary.ineligible, summary.requeued
    );
}

pub fn run(action: MigrateAction) -> CliResult {
    let ctx = Context::open()?;

    match action {
        MigrateAction::Run {
            r#type,
            page_size,
            limit,
            records,
        } => {
            let source = ctx.source(records.as_deref())?;
            let mut orch = ctx.orchestrator()?;
            let mut options = MigrationOptions::from(&ctx.config.migration);
            if let Some(page_size) = page_size {
                options.page_size = page_size.max(1);
            }
            options.limit = limit;

            let rt = runtime()?;
            let mut run = MigrationRun::start(&mut orch, &source, &r#type, options)?;
            if let Some(cursor) = run.state().cursor {
                println!("resuming after record {cursor}");
            }
            let mut n = 0;
            while let Some(item) = rt.block_on(run.next())? {
                n += 1;
                println!("[{n}] {}", item.report.message);
                if item.halted {
                    return Err("migration halted by an authentication failure; fix credentials, run `auth test`, then rerun".into());
                }
            }
            print_state(run.state());
        }
        MigrateAction::Status { r#type, json } => {
            let state = migration::status(ctx.store.as_ref(), &r#type)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                match state {
                    Some(state) => print_state(&state),
                    None => println!("no migration recorded for {}", r#type),
                }
            }
        }
        MigrateAction::Reset { r#type } => {
            if migration::reset(ctx.store.as_ref(), &r#type)? {
                println!("migration progress for {} cleared", r#type);
            } else {
                println!("no migration recorded for {}", r#type);
            }
        }
    }
    Ok(())
}
