use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "fieldbridge", version, about = "One-way CMS to CRM field sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// CRM credentials and the authentication halt
    Auth {
        #[command(subcommand)]
        action: commands::auth::AuthAction,
    },
    /// Record sync and the pending queue
    Sync {
        #[command(subcommand)]
        action: commands::sync::SyncAction,
    },
    /// Field mappings
    Mapping {
        #[command(subcommand)]
        action: commands::mapping::MappingAction,
    },
    /// Audit trail
    Audit {
        #[command(subcommand)]
        action: commands::audit::AuditAction,
    },
    /// Full backfill of existing records
    Migrate {
        #[command(subcommand)]
        action: commands::migrate::MigrateAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FIELDBRIDGE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Auth { action } => commands::auth::run(action),
        Commands::Sync { action } => commands::sync::run(action),
        Commands::Mapping { action } => commands::mapping::run(action),
        Commands::Audit { action } => commands::audit::run(action),
        Commands::Migrate { action } => commands::migrate::run(action),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
