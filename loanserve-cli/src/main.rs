use clap::Parser;
use clap::Subcommand;
use loanserve_cli::DlqCommand;
use loanserve_cli::TopologyCommand;

/// Operator CLI for broker topology management and DLQ maintenance
/// (spec 6): `apply-topology`, `validate-topology`, `migrate-queues`, and
/// `dlq inspect|reprocess|purge|list|analyze`.
#[derive(Debug, Parser)]
#[command(name = "loanserve", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Declare broker topology; exits non-zero on any precondition failure.
    ApplyTopology,
    /// Compare live broker state to the expected topology; exits non-zero on any mismatch.
    ValidateTopology,
    /// Safely redeclare queues, recreating empty ones and versioning non-empty ones.
    MigrateQueues,
    /// Dead-letter queue maintenance: inspect, reprocess, purge, list, analyze.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::ApplyTopology => loanserve_cli::run_topology(TopologyCommand::Apply).await,
        Command::ValidateTopology => loanserve_cli::run_topology(TopologyCommand::Validate).await,
        Command::MigrateQueues => loanserve_cli::run_topology(TopologyCommand::Migrate).await,
        Command::Dlq { command } => loanserve_cli::run_dlq(command).await,
    }
}
