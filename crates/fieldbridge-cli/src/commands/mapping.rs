use clap::Subcommand;
use fieldbridge_core::{FieldMapping, MappingRegistry, Strategy};

use super::{CliResult, Context};

#[derive(Subcommand)]
pub enum MappingAction {
    /// Show the active mappings for a record type
    List {
        #[arg(long, default_value = "post")]
        r#type: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add or replace a saved mapping
    Set {
        /// Local field key
        local_key: String,
        /// Remote CRM field
        remote_field: String,
        #[arg(long, default_value = "post")]
        r#type: String,
        /// none, boolean, comma_separated, custom_delimiter, numeric, date
        #[arg(long, default_value = "none")]
        strategy: String,
        /// Strategy parameter as name=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Remove a saved mapping
    Remove {
        local_key: String,
        #[arg(long, default_value = "post")]
        r#type: String,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

pub fn run(action: MappingAction) -> CliResult {
    let ctx = Context::open()?;
    let registry = MappingRegistry::new(ctx.store.clone());

    match action {
        MappingAction::List { r#type, json } => {
            ctx.config.record_type(&r#type)?;
            let snapshot = registry.snapshot(&r#type)?;
            if json {
                let out = serde_json::json!({
                    "record_type": snapshot.record_type,
                    "mappings": snapshot.mappings,
                    "derived": snapshot.derived,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            for m in &snapshot.mappings {
                let params = m
                    .strategy_params
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!(
                    "{:<28} -> {:<32} {}{}",
                    m.local_key,
                    m.remote_field,
                    m.strategy,
                    if params.is_empty() {
                        String::new()
                    } else {
                        format!(" [{params}]")
                    }
                );
            }
            for d in &snapshot.derived {
                println!(
                    "{:<28} -> {:<32} derived",
                    d.sources.join(" * "),
                    d.remote_field
                );
            }
        }
        MappingAction::Set {
            local_key,
            remote_field,
            r#type,
            strategy,
            params,
        } => {
            ctx.config.record_type(&r#type)?;
            let strategy: Strategy = strategy.parse()?;
            let mut mapping = FieldMapping::new(local_key, remote_field).with_strategy(strategy);
            for (name, value) in params {
                mapping = mapping.with_param(name, value);
            }
            let summary = format!("{} -> {} ({})", mapping.local_key, mapping.remote_field, mapping.strategy);
            registry.set_saved_mapping(&r#type, mapping)?;
            println!("saved {summary}");
        }
        MappingAction::Remove { local_key, r#type } => {
            if registry.remove_saved_mapping(&r#type, &local_key)? {
                println!("removed {local_key}");
            } else {
                println!("no saved mapping for {local_key}");
            }
        }
    }
    Ok(())
}
