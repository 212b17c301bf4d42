//! Validates the scheduler configuration and, with `--check-registry`,
//! performs a registry connection and topology dry run.

use anyhow::Context;
use scheduler_core::config::SchedulerConfig;
use scheduler_core::registry::{JobRegistry, PgJobRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scheduler_core::logging::init_logging(true);

    let config = SchedulerConfig::load().context("failed to load configuration")?;
    config.sanity_check().context("configuration sanity check failed")?;

    println!(
        "Configuration OK: cluster '{}', polling every {:?}, host idle timeout {:?}",
        config.cluster_name, config.polling_interval, config.host_idle_timeout
    );

    if std::env::args().any(|arg| arg == "--check-registry") {
        let registry = PgJobRegistry::connect(&config.database_url)
            .await
            .context("failed to connect to the registry database")?;

        let topology = registry
            .load_cluster(&config.cluster_name, config.layout_required)
            .await
            .context("failed to load cluster topology")?;

        println!(
            "Topology OK: {} queues, {} machines, {} database instances",
            topology.queues.len(),
            topology.machines.len(),
            topology.database_instances.len()
        );
    }

    Ok(())
}
