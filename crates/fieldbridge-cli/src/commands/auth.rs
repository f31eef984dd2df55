use clap::Subcommand;
use fieldbridge_core::CrmApi;

use super::{runtime, CliResult, Context};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Exchange credentials for a fresh token and report the result
    Test,
    /// Show token state and whether syncing is halted
    Status,
    /// Lift the halt left by an authentication failure
    Unblock,
    /// Drop the cached access token
    Logout,
}

pub fn run(action: AuthAction) -> CliResult {
    let ctx = Context::open()?;
    let orch = ctx.orchestrator()?;
    match action {
        AuthAction::Test => {
            if !ctx.config.remote.has_credentials() {
                return Err("client credentials are not configured (remote.client_id / remote.client_secret)".into());
            }
            let report = runtime()?.block_on(orch.test_connection())?;
            if report.ok {
                println!("connection ok: {}", report.message);
            } else {
                let cause = if report.is_network_problem() {
                    "network or service outage"
                } else {
                    "authentication"
                };
                return Err(format!("connection failed ({cause}): {}", report.message).into());
            }
        }
        AuthAction::Status => {
            println!(
                "credentials: {}",
                if ctx.config.remote.has_credentials() {
                    "configured"
                } else {
                    "missing"
                }
            );
            println!("token: {}", orch.api().auth_state().as_str());
            if let Some(expires_at) = orch
                .api()
                .tokens()
                .cached()
                .and_then(|t| t.expires_at)
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            {
                println!("expires: {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            match orch.auth_block()? {
                Some(block) => println!(
                    "sync: halted since {} ({})",
                    block.since.format("%Y-%m-%d %H:%M:%S UTC"),
                    block.reason
                ),
                None => println!("sync: active"),
            }
        }
        AuthAction::Unblock => {
            if orch.clear_auth_block()? {
                println!("auth block cleared");
            } else {
                println!("no auth block set");
            }
        }
        AuthAction::Logout => {
            orch.api().tokens().invalidate();
            println!("access token removed");
        }
    }
    Ok(())
}
