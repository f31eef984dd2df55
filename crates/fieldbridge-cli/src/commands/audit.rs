use clap::Subcommand;
use fieldbridge_core::{AuditCategory, AuditFilter, AuditLevel, AuditTrail};

use super::{CliResult, Context};

#[derive(Subcommand)]
pub enum AuditAction {
    /// List recent audit entries, newest first
    List {
        /// Only entries for this record
        #[arg(long)]
        record: Option<u64>,
        /// validation, transformation, authentication, api, sync, queue, migration, configuration
        #[arg(long)]
        category: Option<AuditCategory>,
        /// info, warning, error
        #[arg(long)]
        level: Option<AuditLevel>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(action: AuditAction) -> CliResult {
    let ctx = Context::open()?;
    let trail = AuditTrail::new(ctx.store.clone());

    match action {
        AuditAction::List {
            record,
            category,
            level,
            limit,
            json,
        } => {
            let entries = trail.recent(&AuditFilter {
                record_id: record,
                category,
                level,
                limit,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("no audit entries");
            }
            for entry in &entries {
                let record = entry
                    .record_id
                    .map(|id| format!("#{id}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {:<7} {:<14} {:<6} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.level,
                    entry.category,
                    record,
                    entry.message
                );
                if !entry.context.is_empty() {
                    println!("    {}", serde_json::Value::Object(entry.context.clone()));
                }
            }
        }
    }
    Ok(())
}
