//! Pipeline runner - loads every source into the warehouse, then builds
//! the datamarts into the local store

use anyhow::{bail, Context, Result};
use blood_donation_pipeline::config::{Config, WarehouseBackend};
use blood_donation_pipeline::logging::init_logging;
use blood_donation_pipeline::pipeline::fetch::HttpAcquirer;
use blood_donation_pipeline::pipeline::store::SqliteStore;
use blood_donation_pipeline::pipeline::warehouse::{BigQueryWarehouse, SqliteWarehouse, Warehouse};
use blood_donation_pipeline::pipeline::Pipeline;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    let log_path = init_logging(&config.log_dir)?;

    info!("Starting blood donation pipeline");
    info!("Logging to {:?}", log_path);
    info!(
        "Configuration loaded: {} sources, warehouse schema {}",
        config.sources.len(),
        config.schema
    );

    let warehouse: Box<dyn Warehouse> = match config.backend {
        WarehouseBackend::BigQuery => Box::new(BigQueryWarehouse::new(config.bigquery()?)?),
        WarehouseBackend::Sqlite => Box::new(
            SqliteWarehouse::open(&config.warehouse_sqlite_path, &config.schema)
                .await
                .context("Failed to open SQLite warehouse")?,
        ),
    };

    let store = SqliteStore::open(&config.local_store_path)
        .await
        .context("Failed to open local store")?;
    let acquirer = HttpAcquirer::new(config.http_timeout)?;

    let pipeline = Pipeline::new(&acquirer, warehouse.as_ref(), &store);
    let result = pipeline.run(&config.plan()).await;
    store.close().await;

    let report = result?;
    for stats in &report.loaded {
        info!("✓ {}", stats);
    }
    for stats in &report.datamarts {
        info!("✓ {}", stats);
    }

    if !report.is_success() {
        for failure in &report.failures {
            error!("✗ {}", failure);
        }
        bail!("{} step(s) failed in run {}", report.failures.len(), report.run_id);
    }

    info!("Blood donation pipeline complete");
    Ok(())
}
