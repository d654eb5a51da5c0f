//! Keygate CLI - operator tooling for passkey storage.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

mod commands;
mod exit_codes;

use exit_codes::ExitCode;

const EXIT_CODES_HELP: &str = "Exit codes:
  0   Success
  1   General error
  65  Stored record could not be decoded
  66  Credential not found for this user
  69  Database unavailable
  78  Configuration error (DATABASE_URL unset or invalid settings)";

#[derive(Parser)]
#[command(name = "keygate")]
#[command(author, version, about = "Passkey credential and challenge state administration", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// List a user's passkeys
    Credentials {
        /// User ID (UUID)
        #[arg(value_name = "USER_ID")]
        user_id: Uuid,
    },

    /// Remove one of a user's passkeys
    Remove {
        /// User ID (UUID)
        #[arg(value_name = "USER_ID")]
        user_id: Uuid,

        /// Credential record ID (UUID, as shown by `credentials`)
        #[arg(value_name = "CREDENTIAL_ID")]
        credential_id: Uuid,
    },

    /// List every passkey flagged as possibly cloned
    CloneWarnings,

    /// Delete challenge state older than the challenge TTL
    PurgeSessions {
        /// Age in seconds (defaults to KEYGATE_CHALLENGE_TTL_SECS)
        #[arg(long, value_name = "SECS")]
        older_than: Option<u64>,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "keygate_core=warn,keygate=info",
        1 => "keygate_core=info,keygate=info",
        _ => "keygate_core=debug,keygate=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Migrate => commands::migrate::execute().await,
        Commands::Credentials { user_id } => commands::credentials::list(user_id).await,
        Commands::Remove {
            user_id,
            credential_id,
        } => commands::credentials::remove(user_id, credential_id).await,
        Commands::CloneWarnings => commands::credentials::clone_warnings().await,
        Commands::PurgeSessions { older_than } => commands::sessions::purge(older_than).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit = match run(cli).await {
        Ok(()) => ExitCode::success(),
        Err(err) => ExitCode::from_anyhow(&err),
    };

    if let Some(message) = &exit.message {
        eprintln!("{} {}", "error:".red().bold(), message);
    }
    std::process::exit(exit.code);
}
