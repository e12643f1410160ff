//! End-to-end runs against a stub acquirer, the SQLite warehouse and an
//! in-memory local store

use async_trait::async_trait;
use blood_donation_pipeline::config::Config;
use blood_donation_pipeline::pipeline::datamart::{DatamartDefinition, QueryContext};
use blood_donation_pipeline::pipeline::error::FetchError;
use blood_donation_pipeline::pipeline::fetch::Acquire;
use blood_donation_pipeline::pipeline::store::{LocalStore, SqliteStore};
use blood_donation_pipeline::pipeline::utils::logical_name_from_location;
use blood_donation_pipeline::pipeline::warehouse::{SqliteWarehouse, Warehouse};
use blood_donation_pipeline::pipeline::{
    AcquiredTable, Destination, FailurePolicy, Pipeline, PipelineError, RunPlan,
    SourceDescriptor, Stage,
};
use polars::df;
use polars::prelude::{DataFrame, DataType};
use std::collections::HashMap;
use std::sync::Mutex;

const SCHEMA: &str = "blood_donation";
const DONATIONS_STATE: &str =
    "https://raw.githubusercontent.com/MoH-Malaysia/data-darah-public/main/donations_state.csv";
const DONATIONS_FACILITY: &str =
    "https://raw.githubusercontent.com/MoH-Malaysia/data-darah-public/main/donations_facility.csv";
const GRANULAR: &str = "https://example.org/blood_donation_retention_2024.parquet";

/// Serves canned frames by location; unknown locations fail like a 404
#[derive(Default)]
struct StubAcquirer {
    tables: Mutex<HashMap<String, DataFrame>>,
    calls: Mutex<Vec<String>>,
}

impl StubAcquirer {
    fn with(self, location: &str, frame: DataFrame) -> Self {
        self.set(location, frame);
        self
    }

    fn set(&self, location: &str, frame: DataFrame) {
        self.tables
            .lock()
            .unwrap()
            .insert(location.to_string(), frame);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Acquire for StubAcquirer {
    async fn acquire(&self, descriptor: &SourceDescriptor) -> Result<AcquiredTable, PipelineError> {
        self.calls.lock().unwrap().push(descriptor.location.clone());

        let frame = self
            .tables
            .lock()
            .unwrap()
            .get(&descriptor.location)
            .cloned()
            .ok_or_else(|| PipelineError::Retrieval {
                location: descriptor.location.clone(),
                source: FetchError::Status(reqwest::StatusCode::NOT_FOUND),
            })?;

        Ok(AcquiredTable {
            logical_name: logical_name_from_location(&descriptor.location).unwrap(),
            resolved_location: descriptor.location.clone(),
            frame,
        })
    }
}

fn donations_state() -> DataFrame {
    df!(
        "state" => ["Johor", "Johor", "Kedah", "Kedah", "Selangor"],
        "date" => ["2024-01-01", "2024-01-02", "not-a-date", "2024-01-02", "2024-01-01"],
        "donations" => [10i64, 20, 4, 6, 30],
    )
    .unwrap()
}

fn donations_facility() -> DataFrame {
    df!(
        "hospital" => ["Hospital Sultanah Aminah", "Hospital Sultanah Bahiyah"],
        "date" => ["2024-01-01", "01/01/2024"],
        "daily" => [42i64, 17],
    )
    .unwrap()
}

fn granular() -> DataFrame {
    df!(
        "donor_id" => ["a1", "a1", "b2"],
        "visit_date" => ["2023-01-05", "2023-06-05", "2024-02-10"],
        "birth_date" => [1990i64, 1990, 1975],
    )
    .unwrap()
}

fn avg_by_state() -> DatamartDefinition {
    DatamartDefinition::template(
        "avg_donations_by_state",
        "SELECT state, AVG(donations) AS avg_donations FROM {schema}.donations_state GROUP BY state ORDER BY state",
    )
}

fn total_donations() -> DatamartDefinition {
    DatamartDefinition::literal(
        "total_donations",
        "SELECT SUM(donations) AS total FROM blood_donation.donations_state",
    )
}

fn plan(sources: &[&str], datamarts: Vec<DatamartDefinition>) -> RunPlan {
    RunPlan {
        schema: SCHEMA.to_string(),
        sources: sources.iter().copied().map(SourceDescriptor::new).collect(),
        date_columns: vec!["date".to_string(), "visit_date".to_string()],
        datamarts,
        query_context: QueryContext::new("local", SCHEMA),
        failure_policy: FailurePolicy::FailFast,
    }
}

fn first_f64(frame: &DataFrame, name: &str) -> Option<f64> {
    frame
        .column(name)
        .unwrap()
        .cast(&DataType::Float64)
        .unwrap()
        .as_materialized_series()
        .f64()
        .unwrap()
        .get(0)
}

async fn warehouse_table(warehouse: &SqliteWarehouse, name: &str) -> DataFrame {
    warehouse
        .query(&format!("SELECT * FROM {}.{}", SCHEMA, name))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_end_to_end_average_by_state() {
    let acquirer = StubAcquirer::default().with(DONATIONS_STATE, donations_state());
    let warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();

    let report = Pipeline::new(&acquirer, &warehouse, &store)
        .run(&plan(&[DONATIONS_STATE], vec![avg_by_state()]))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.loaded.len(), 1);
    assert_eq!(report.loaded[0].rows, 5);

    let loaded = warehouse_table(&warehouse, "donations_state").await;
    let date = loaded.column("date").unwrap();
    assert_eq!(date.dtype(), &DataType::Date);
    assert_eq!(date.null_count(), 1);

    let mart = store.read_table("avg_donations_by_state").await.unwrap();
    assert_eq!(mart.height(), 3);
    assert_eq!(mart.column("avg_donations").unwrap().dtype(), &DataType::Float64);

    let averages: Vec<Option<f64>> = mart
        .column("avg_donations")
        .unwrap()
        .as_materialized_series()
        .f64()
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(averages, vec![Some(15.0), Some(5.0), Some(30.0)]);
}

#[tokio::test]
async fn test_destination_named_after_resolved_file() {
    let acquirer = StubAcquirer::default().with(DONATIONS_FACILITY, donations_facility());
    let warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();

    let report = Pipeline::new(&acquirer, &warehouse, &store)
        .run(&plan(&[DONATIONS_FACILITY], vec![]))
        .await
        .unwrap();

    assert_eq!(
        report.loaded[0].destination,
        Destination::new(SCHEMA, "donations_facility")
    );
    assert_eq!(warehouse_table(&warehouse, "donations_facility").await.height(), 2);
}

#[tokio::test]
async fn test_absent_date_column_is_skipped_per_source() {
    // donations_state has `date` only, the granular table has `visit_date` only
    let acquirer = StubAcquirer::default()
        .with(DONATIONS_STATE, donations_state())
        .with(GRANULAR, granular());
    let warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();

    let report = Pipeline::new(&acquirer, &warehouse, &store)
        .run(&plan(&[DONATIONS_STATE, GRANULAR], vec![]))
        .await
        .unwrap();
    assert_eq!(report.loaded.len(), 2);

    let state = warehouse_table(&warehouse, "donations_state").await;
    let names: Vec<&str> = state
        .get_column_names()
        .iter()
        .map(|name| name.as_str())
        .collect();
    assert_eq!(names, vec!["state", "date", "donations"]);

    let retention = warehouse_table(&warehouse, "blood_donation_retention_2024").await;
    assert_eq!(retention.column("visit_date").unwrap().dtype(), &DataType::Date);
    assert_eq!(retention.column("visit_date").unwrap().null_count(), 0);
    assert_eq!(retention.column("birth_date").unwrap().dtype(), &DataType::Int64);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let acquirer = StubAcquirer::default().with(DONATIONS_STATE, donations_state());
    let warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();
    let pipeline = Pipeline::new(&acquirer, &warehouse, &store);
    let plan = plan(&[DONATIONS_STATE], vec![avg_by_state(), total_donations()]);

    pipeline.run(&plan).await.unwrap();
    let first_avg = store.read_table("avg_donations_by_state").await.unwrap();
    let first_total = store.read_table("total_donations").await.unwrap();

    pipeline.run(&plan).await.unwrap();
    let second_avg = store.read_table("avg_donations_by_state").await.unwrap();
    let second_total = store.read_table("total_donations").await.unwrap();

    assert!(first_avg.equals_missing(&second_avg));
    assert!(first_total.equals_missing(&second_total));
    assert_eq!(warehouse_table(&warehouse, "donations_state").await.height(), 5);
}

#[tokio::test]
async fn test_datamart_order_does_not_change_content() {
    let acquirer = StubAcquirer::default().with(DONATIONS_STATE, donations_state());

    let forward_warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let forward_store = SqliteStore::in_memory().await.unwrap();
    Pipeline::new(&acquirer, &forward_warehouse, &forward_store)
        .run(&plan(&[DONATIONS_STATE], vec![avg_by_state(), total_donations()]))
        .await
        .unwrap();

    let reverse_warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let reverse_store = SqliteStore::in_memory().await.unwrap();
    Pipeline::new(&acquirer, &reverse_warehouse, &reverse_store)
        .run(&plan(&[DONATIONS_STATE], vec![total_donations(), avg_by_state()]))
        .await
        .unwrap();

    for name in ["avg_donations_by_state", "total_donations"] {
        let forward = forward_store.read_table(name).await.unwrap();
        let reverse = reverse_store.read_table(name).await.unwrap();
        assert!(forward.equals_missing(&reverse), "{} differs", name);
    }
}

#[tokio::test]
async fn test_reload_replaces_previous_rows() {
    let acquirer = StubAcquirer::default().with(DONATIONS_STATE, donations_state());
    let warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();
    let pipeline = Pipeline::new(&acquirer, &warehouse, &store);
    let plan = plan(&[DONATIONS_STATE], vec![avg_by_state()]);

    pipeline.run(&plan).await.unwrap();

    acquirer.set(
        DONATIONS_STATE,
        df!(
            "state" => ["Perlis"],
            "date" => ["2024-03-01"],
            "donations" => [8i64],
        )
        .unwrap(),
    );
    pipeline.run(&plan).await.unwrap();

    assert_eq!(warehouse_table(&warehouse, "donations_state").await.height(), 1);
    let mart = store.read_table("avg_donations_by_state").await.unwrap();
    assert_eq!(mart.height(), 1);
}

#[tokio::test]
async fn test_first_failure_aborts_run() {
    let acquirer = StubAcquirer::default().with(DONATIONS_STATE, donations_state());
    let warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();

    let err = Pipeline::new(&acquirer, &warehouse, &store)
        .run(&plan(
            &["https://example.org/missing.csv", DONATIONS_STATE],
            vec![avg_by_state()],
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Retrieval { .. }));
    assert_eq!(acquirer.calls(), vec!["https://example.org/missing.csv"]);
    assert!(store.read_table("avg_donations_by_state").await.is_err());
}

#[tokio::test]
async fn test_isolated_failures_are_reported() {
    let acquirer = StubAcquirer::default().with(DONATIONS_STATE, donations_state());
    let warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();

    let mut plan = plan(
        &["https://example.org/missing.csv", DONATIONS_STATE],
        vec![
            DatamartDefinition::literal("broken", "SELECT * FROM blood_donation.nothing_here"),
            avg_by_state(),
        ],
    );
    plan.failure_policy = FailurePolicy::Isolate;

    let report = Pipeline::new(&acquirer, &warehouse, &store)
        .run(&plan)
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.loaded.len(), 1);
    assert_eq!(report.datamarts.len(), 1);

    let stages: Vec<Stage> = report.failures.iter().map(|f| f.stage).collect();
    assert_eq!(stages, vec![Stage::Acquire, Stage::BuildDatamart]);
    assert_eq!(report.failures[1].item, "broken");
    assert_eq!(store.read_table("avg_donations_by_state").await.unwrap().height(), 3);
}

#[tokio::test]
async fn test_duplicate_datamarts_rejected_before_any_work() {
    let acquirer = StubAcquirer::default().with(DONATIONS_STATE, donations_state());
    let warehouse = SqliteWarehouse::in_memory(SCHEMA).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();

    let err = Pipeline::new(&acquirer, &warehouse, &store)
        .run(&plan(&[DONATIONS_STATE], vec![avg_by_state(), avg_by_state()]))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Config(_)));
    assert!(acquirer.calls().is_empty());
}

#[tokio::test]
async fn test_sqlite_backend_builds_the_compiled_in_datamarts() {
    let config = Config::from_lookup(|key| match key {
        "WAREHOUSE_BACKEND" => Some("sqlite".to_string()),
        "SOURCE_URLS" => Some(GRANULAR.to_string()),
        _ => None,
    })
    .unwrap();

    let retention = df!(
        "donor_id" => ["a1", "a1", "b2", "c3", "c3"],
        "visit_date" => ["2023-01-05", "2023-06-05", "2024-02-10", "2022-03-01", "2022-05-01"],
        "birth_date" => [1990i64, 1990, 1975, 2000, 2000],
    )
    .unwrap();
    let acquirer = StubAcquirer::default().with(GRANULAR, retention);
    let warehouse = SqliteWarehouse::in_memory(&config.schema).await.unwrap();
    let store = SqliteStore::in_memory().await.unwrap();

    let report = Pipeline::new(&acquirer, &warehouse, &store)
        .run(&config.plan())
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.datamarts.len(), 4);

    let by_age = store
        .read_table("granular_average_donations_by_age_group_query")
        .await
        .unwrap();
    assert_eq!(by_age.height(), 3);
    assert_eq!(store.read_table("granular_cohorts_query").await.unwrap().height(), 3);

    let churn = store
        .read_table("granular_average_months_before_churn_query_v2")
        .await
        .unwrap();
    assert_eq!(first_f64(&churn, "churned_donors"), Some(1.0));
    assert_eq!(first_f64(&churn, "average_months_before_churn"), Some(2.0));

    let between = store
        .read_table("granular_average_months_between_donations_query")
        .await
        .unwrap();
    assert_eq!(first_f64(&between, "repeat_donors"), Some(2.0));
    assert_eq!(first_f64(&between, "average_months_between_donations"), Some(3.5));
}
