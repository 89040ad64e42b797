use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use loanserve_broker::DeclareReport;
use loanserve_broker::MigrationAction;
use loanserve_broker::Mismatch;
use loanserve_broker::TopologyManager;
use loanserve_broker::default_topology;
use loanserve_config::Config;

/// One of the three topology-maintenance operations spec 6 exposes at the
/// top level (`apply-topology`, `validate-topology`, `migrate-queues`).
#[derive(Debug, Clone, Copy)]
pub enum TopologyCommand {
    Apply,
    Validate,
    Migrate,
}

pub async fn run(command: TopologyCommand) -> Result<()> {
    match command {
        TopologyCommand::Apply => run_apply().await,
        TopologyCommand::Validate => run_validate().await,
        TopologyCommand::Migrate => run_migrate().await,
    }
}

fn print_declare_report(report: &DeclareReport) {
    println!(
        "Declared {} exchanges, applied {} bindings.",
        report.declared_exchanges, report.bindings_applied
    );
    for outcome in &report.queue_outcomes {
        let action = match outcome.action {
            MigrationAction::Declared => "declared",
            MigrationAction::RecreatedEmpty => "recreated (was empty)",
            MigrationAction::Versioned => "versioned (had live traffic)",
        };
        println!("- {} -> {action} as {}", outcome.queue, outcome.resolved_name);
    }
}

fn describe_mismatch(mismatch: &Mismatch) -> String {
    match mismatch {
        Mismatch::MissingQueue(name) => format!("queue {name} does not exist"),
        Mismatch::MissingExchange(name) => format!("exchange {name} does not exist"),
        Mismatch::WrongQueueType { queue, expected, actual } => {
            format!("queue {queue} is {actual:?}, expected {expected:?}")
        }
        Mismatch::WrongExchangeType { exchange, expected, actual } => {
            format!("exchange {exchange} is {actual:?}, expected {expected:?}")
        }
        Mismatch::QuorumPriorityConflict(name) => {
            format!("queue {name} is quorum type but declares max-priority")
        }
    }
}

#[cfg(feature = "lapin-store")]
async fn run_apply() -> Result<()> {
    let config = Config::load().context("loading broker configuration")?;
    let connection = lapin::Connection::connect(&config.broker.url, lapin::ConnectionProperties::default())
        .await
        .context("connecting to broker")?;
    let manager = loanserve_broker::LapinTopologyManager::new(connection);
    let report = manager.declare(&default_topology()).await.map_err(|err| anyhow!(err))?;
    print_declare_report(&report);
    Ok(())
}

#[cfg(not(feature = "lapin-store"))]
async fn run_apply() -> Result<()> {
    anyhow::bail!("apply-topology requires the `lapin-store` feature")
}

#[cfg(feature = "lapin-store")]
async fn run_migrate() -> Result<()> {
    let config = Config::load().context("loading broker configuration")?;
    let connection = lapin::Connection::connect(&config.broker.url, lapin::ConnectionProperties::default())
        .await
        .context("connecting to broker")?;
    let manager = loanserve_broker::LapinTopologyManager::new(connection);
    let report = manager.declare(&default_topology()).await.map_err(|err| anyhow!(err))?;
    let migrations = report.migrations();
    if migrations.is_empty() {
        println!("No migrations needed; live topology already matches.");
        return Ok(());
    }
    println!("Migrated {} queue(s):", migrations.len());
    for outcome in migrations {
        println!("- {} -> {}", outcome.queue, outcome.resolved_name);
    }
    Ok(())
}

#[cfg(not(feature = "lapin-store"))]
async fn run_migrate() -> Result<()> {
    anyhow::bail!("migrate-queues requires the `lapin-store` feature")
}

#[cfg(feature = "management-http")]
async fn run_validate() -> Result<()> {
    let config = Config::load().context("loading broker configuration")?;
    let mgmt_url = config
        .broker
        .mgmt_url
        .clone()
        .ok_or_else(|| anyhow!("BROKER_MGMT_URL is required for validate-topology"))?;
    let client = loanserve_broker::HttpManagementClient::new(mgmt_url, config.broker.vhost.clone())
        .map_err(|err| anyhow!(err))?;
    let report = loanserve_broker::validate_topology(&client, &default_topology())
        .await
        .map_err(|err| anyhow!(err))?;

    if report.is_clean() {
        println!("Live broker topology matches the expected topology.");
        return Ok(());
    }

    println!("Found {} mismatch(es):", report.mismatches.len());
    for mismatch in &report.mismatches {
        println!("- {}", describe_mismatch(mismatch));
    }
    anyhow::bail!("{} topology mismatch(es) found", report.mismatches.len());
}

#[cfg(not(feature = "management-http"))]
async fn run_validate() -> Result<()> {
    anyhow::bail!("validate-topology requires the `management-http` feature")
}
