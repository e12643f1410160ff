//! Pipeline orchestrator
//!
//! One run is `START -> (acquire -> clean -> load)* -> build datamarts -> DONE`,
//! sources in configuration order, every call awaited before the next one.
//! Nothing is retried; rerunning after a failure is safe because every
//! write replaces its target.

use crate::pipeline::clean::clean;
use crate::pipeline::datamart::{self, DatamartDefinition, QueryContext};
use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::fetch::Acquire;
use crate::pipeline::store::LocalStore;
use crate::pipeline::types::{
    Destination, FailurePolicy, LoadStats, RunReport, SourceDescriptor, Stage, StageFailure,
};
use crate::pipeline::warehouse::{self, Warehouse};
use tracing::{error, info};
use uuid::Uuid;

/// Everything a run needs besides its collaborators
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Warehouse schema that raw tables are loaded into
    pub schema: String,
    pub sources: Vec<SourceDescriptor>,
    /// Column names treated as dates wherever they appear
    pub date_columns: Vec<String>,
    pub datamarts: Vec<DatamartDefinition>,
    pub query_context: QueryContext,
    pub failure_policy: FailurePolicy,
}

pub struct Pipeline<'a> {
    acquirer: &'a dyn Acquire,
    warehouse: &'a dyn Warehouse,
    store: &'a dyn LocalStore,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        acquirer: &'a dyn Acquire,
        warehouse: &'a dyn Warehouse,
        store: &'a dyn LocalStore,
    ) -> Self {
        Self {
            acquirer,
            warehouse,
            store,
        }
    }

    pub async fn run(&self, plan: &RunPlan) -> Result<RunReport> {
        let mut report = RunReport::new(Uuid::new_v4());
        info!("Beginning pipeline run {}", report.run_id);

        datamart::validate(&plan.datamarts)?;

        match self.execute(plan, &mut report).await {
            Ok(()) => {
                if report.is_success() {
                    info!("Pipeline run {} succeeded: {}", report.run_id, report);
                } else {
                    error!("Pipeline run {} finished with failures: {}", report.run_id, report);
                }
                Ok(report)
            }
            Err(e) => {
                error!("Pipeline run {} failed: {}", report.run_id, e);
                Err(e)
            }
        }
    }

    async fn execute(&self, plan: &RunPlan, report: &mut RunReport) -> Result<()> {
        for source in &plan.sources {
            match self.process_source(plan, source).await {
                Ok(stats) => {
                    info!("Loaded {}", stats);
                    report.loaded.push(stats);
                }
                Err(e) if plan.failure_policy == FailurePolicy::Isolate => {
                    error!("Source {} failed: {}", source, e);
                    report.failures.push(StageFailure {
                        stage: stage_of(&e),
                        item: source.location.clone(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!("Processing raw tables in warehouse");
        let datamarts = datamart::materialize(
            self.warehouse,
            self.store,
            &plan.datamarts,
            &plan.query_context,
            plan.failure_policy,
        )
        .await?;

        report.datamarts.extend(datamarts.built);
        report.failures.extend(datamarts.failures);

        if report.is_success() {
            info!("Successfully wrote datamarts to local store");
        }
        Ok(())
    }

    async fn process_source(&self, plan: &RunPlan, source: &SourceDescriptor) -> Result<LoadStats> {
        let acquired = self.acquirer.acquire(source).await?;
        let destination = Destination::new(&plan.schema, &acquired.logical_name);

        let cleaned = clean(acquired.frame, &plan.date_columns).map_err(|source| {
            PipelineError::Normalization {
                table: acquired.logical_name.clone(),
                source,
            }
        })?;

        info!("Writing {} to warehouse table {}", acquired.resolved_location, destination);
        warehouse::load(self.warehouse, &cleaned, &destination).await
    }
}

fn stage_of(error: &PipelineError) -> Stage {
    match error {
        PipelineError::Retrieval { .. } | PipelineError::Config(_) => Stage::Acquire,
        PipelineError::Normalization { .. } => Stage::Normalize,
        PipelineError::WarehouseWrite { .. } => Stage::Load,
        PipelineError::QueryExecution { .. } | PipelineError::LocalWrite { .. } => {
            Stage::BuildDatamart
        }
    }
}
