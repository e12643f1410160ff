//! Datamart builder - runs aggregation queries against the warehouse and
//! materializes each result as a table in the local store

use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::store::LocalStore;
use crate::pipeline::types::{FailurePolicy, MaterializeStats, Stage, StageFailure};
use crate::pipeline::warehouse::Warehouse;
use std::collections::HashSet;
use tracing::{error, info};

/// SQL behind a datamart: literal text, or a template resolved per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatamartQuery {
    Literal(String),
    /// SQL with `{project}` and `{schema}` placeholders
    Template(String),
}

/// Values substituted into templated queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub project: String,
    pub schema: String,
}

impl QueryContext {
    pub fn new(project: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            schema: schema.into(),
        }
    }
}

impl DatamartQuery {
    pub fn resolve(&self, context: &QueryContext) -> String {
        match self {
            DatamartQuery::Literal(sql) => sql.clone(),
            DatamartQuery::Template(template) => template
                .replace("{project}", &context.project)
                .replace("{schema}", &context.schema),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatamartDefinition {
    /// Name of the local table the result is written to
    pub name: String,
    pub query: DatamartQuery,
}

impl DatamartDefinition {
    pub fn literal(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: DatamartQuery::Literal(sql.into()),
        }
    }

    pub fn template(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: DatamartQuery::Template(template.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatamartReport {
    pub built: Vec<MaterializeStats>,
    pub failures: Vec<StageFailure>,
}

/// Each datamart name must identify exactly one local table.
/// Table names in the local store ignore ASCII case, so names are compared
/// the same way.
pub fn validate(datamarts: &[DatamartDefinition]) -> Result<()> {
    let mut seen = HashSet::new();

    for datamart in datamarts {
        if datamart.name.trim().is_empty() {
            return Err(PipelineError::Config(
                "datamart name must not be empty".to_string(),
            ));
        }
        if !seen.insert(datamart.name.to_ascii_lowercase()) {
            return Err(PipelineError::Config(format!(
                "duplicate datamart name: {}",
                datamart.name
            )));
        }
    }

    Ok(())
}

/// Query the warehouse and replace the local table named after the datamart
pub async fn materialize_one(
    warehouse: &dyn Warehouse,
    store: &dyn LocalStore,
    datamart: &DatamartDefinition,
    context: &QueryContext,
) -> Result<MaterializeStats> {
    let sql = datamart.query.resolve(context);

    let result = warehouse
        .query(&sql)
        .await
        .map_err(|source| PipelineError::QueryExecution {
            datamart: datamart.name.clone(),
            source,
        })?;

    info!("Creating datamart {} in local store", datamart.name);
    let rows = store
        .replace_table(&datamart.name, &result)
        .await
        .map_err(|source| PipelineError::LocalWrite {
            table: datamart.name.clone(),
            source,
        })?;

    Ok(MaterializeStats {
        datamart: datamart.name.clone(),
        rows,
        columns: result.width(),
    })
}

/// Build every datamart in the given order.
///
/// Under `FailFast` the first failure is returned; under `Isolate` it is
/// logged, recorded in the report, and the next datamart is built.
pub async fn materialize(
    warehouse: &dyn Warehouse,
    store: &dyn LocalStore,
    datamarts: &[DatamartDefinition],
    context: &QueryContext,
    policy: FailurePolicy,
) -> Result<DatamartReport> {
    validate(datamarts)?;

    let mut report = DatamartReport::default();

    for datamart in datamarts {
        match materialize_one(warehouse, store, datamart, context).await {
            Ok(stats) => {
                info!("Built datamart {}", stats);
                report.built.push(stats);
            }
            Err(e) if policy == FailurePolicy::Isolate => {
                error!("Datamart {} failed: {}", datamart.name, e);
                report.failures.push(StageFailure {
                    stage: Stage::BuildDatamart,
                    item: datamart.name.clone(),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}
