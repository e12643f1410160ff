//! Compiled-in datamart queries over the granular donor retention table.
//!
//! `{project}` and `{schema}` are filled in from the run's query context.
//! Every query orders its output so reruns produce identical tables.
//! Each datamart exists in two dialects with the same output columns: one
//! for BigQuery and one for the SQLite warehouse used in dry runs.

use crate::pipeline::datamart::DatamartDefinition;

/// SQL dialect of the warehouse the datamarts run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    BigQuery,
    Sqlite,
}

pub const GRANULAR_AVERAGE_DONATIONS_BY_AGE_GROUP: &str = r#"
WITH donors AS (
    SELECT
        donor_id,
        COUNT(*) AS donations,
        EXTRACT(YEAR FROM MIN(visit_date)) - ANY_VALUE(birth_date) AS age_at_first_donation
    FROM `{project}.{schema}.blood_donation_retention_2024`
    WHERE visit_date IS NOT NULL
    GROUP BY donor_id
)
SELECT
    CASE
        WHEN age_at_first_donation < 20 THEN '17-19'
        WHEN age_at_first_donation < 30 THEN '20-29'
        WHEN age_at_first_donation < 40 THEN '30-39'
        WHEN age_at_first_donation < 50 THEN '40-49'
        WHEN age_at_first_donation < 60 THEN '50-59'
        ELSE '60+'
    END AS age_group,
    COUNT(*) AS donors,
    AVG(donations) AS average_donations
FROM donors
WHERE age_at_first_donation IS NOT NULL
GROUP BY age_group
ORDER BY age_group
"#;

pub const GRANULAR_COHORTS: &str = r#"
WITH first_visits AS (
    SELECT donor_id, MIN(visit_date) AS first_visit
    FROM `{project}.{schema}.blood_donation_retention_2024`
    WHERE visit_date IS NOT NULL
    GROUP BY donor_id
),
visits AS (
    SELECT DISTINCT
        t.donor_id,
        EXTRACT(YEAR FROM f.first_visit) AS cohort_year,
        EXTRACT(YEAR FROM t.visit_date) AS visit_year
    FROM `{project}.{schema}.blood_donation_retention_2024` AS t
    JOIN first_visits AS f USING (donor_id)
    WHERE t.visit_date IS NOT NULL
)
SELECT
    cohort_year,
    visit_year - cohort_year AS years_since_first_donation,
    COUNT(DISTINCT donor_id) AS active_donors
FROM visits
GROUP BY cohort_year, years_since_first_donation
ORDER BY cohort_year, years_since_first_donation
"#;

/// A donor has churned once a year has passed since their last visit,
/// measured against the latest visit in the table.
pub const GRANULAR_AVERAGE_MONTHS_BEFORE_CHURN_V2: &str = r#"
WITH spans AS (
    SELECT
        donor_id,
        MIN(visit_date) AS first_visit,
        MAX(visit_date) AS last_visit
    FROM `{project}.{schema}.blood_donation_retention_2024`
    WHERE visit_date IS NOT NULL
    GROUP BY donor_id
),
latest AS (
    SELECT MAX(last_visit) AS as_of FROM spans
)
SELECT
    COUNT(*) AS churned_donors,
    AVG(DATE_DIFF(last_visit, first_visit, MONTH)) AS average_months_before_churn
FROM spans
CROSS JOIN latest
WHERE DATE_DIFF(as_of, last_visit, MONTH) >= 12
"#;

pub const GRANULAR_AVERAGE_MONTHS_BETWEEN_DONATIONS: &str = r#"
WITH ordered AS (
    SELECT
        donor_id,
        visit_date,
        LAG(visit_date) OVER (PARTITION BY donor_id ORDER BY visit_date) AS previous_visit
    FROM `{project}.{schema}.blood_donation_retention_2024`
    WHERE visit_date IS NOT NULL
)
SELECT
    COUNT(DISTINCT donor_id) AS repeat_donors,
    AVG(DATE_DIFF(visit_date, previous_visit, MONTH)) AS average_months_between_donations
FROM ordered
WHERE previous_visit IS NOT NULL
"#;

pub const SQLITE_AVERAGE_DONATIONS_BY_AGE_GROUP: &str = r#"
WITH donors AS (
    SELECT
        donor_id,
        COUNT(*) AS donations,
        CAST(strftime('%Y', MIN(visit_date)) AS INTEGER) - MIN(birth_date) AS age_at_first_donation
    FROM {schema}.blood_donation_retention_2024
    WHERE visit_date IS NOT NULL
    GROUP BY donor_id
)
SELECT
    CASE
        WHEN age_at_first_donation < 20 THEN '17-19'
        WHEN age_at_first_donation < 30 THEN '20-29'
        WHEN age_at_first_donation < 40 THEN '30-39'
        WHEN age_at_first_donation < 50 THEN '40-49'
        WHEN age_at_first_donation < 60 THEN '50-59'
        ELSE '60+'
    END AS age_group,
    COUNT(*) AS donors,
    AVG(donations) AS average_donations
FROM donors
WHERE age_at_first_donation IS NOT NULL
GROUP BY age_group
ORDER BY age_group
"#;

pub const SQLITE_COHORTS: &str = r#"
WITH first_visits AS (
    SELECT donor_id, MIN(visit_date) AS first_visit
    FROM {schema}.blood_donation_retention_2024
    WHERE visit_date IS NOT NULL
    GROUP BY donor_id
),
visits AS (
    SELECT DISTINCT
        t.donor_id AS donor_id,
        CAST(strftime('%Y', f.first_visit) AS INTEGER) AS cohort_year,
        CAST(strftime('%Y', t.visit_date) AS INTEGER) AS visit_year
    FROM {schema}.blood_donation_retention_2024 AS t
    JOIN first_visits AS f ON f.donor_id = t.donor_id
    WHERE t.visit_date IS NOT NULL
)
SELECT
    cohort_year,
    visit_year - cohort_year AS years_since_first_donation,
    COUNT(DISTINCT donor_id) AS active_donors
FROM visits
GROUP BY cohort_year, years_since_first_donation
ORDER BY cohort_year, years_since_first_donation
"#;

/// Months are counted as `year * 12 + month`, matching `DATE_DIFF(.., MONTH)`
pub const SQLITE_AVERAGE_MONTHS_BEFORE_CHURN_V2: &str = r#"
WITH spans AS (
    SELECT
        donor_id,
        CAST(strftime('%Y', MIN(visit_date)) AS INTEGER) * 12
            + CAST(strftime('%m', MIN(visit_date)) AS INTEGER) AS first_month,
        CAST(strftime('%Y', MAX(visit_date)) AS INTEGER) * 12
            + CAST(strftime('%m', MAX(visit_date)) AS INTEGER) AS last_month
    FROM {schema}.blood_donation_retention_2024
    WHERE visit_date IS NOT NULL
    GROUP BY donor_id
),
latest AS (
    SELECT MAX(last_month) AS as_of FROM spans
)
SELECT
    COUNT(*) AS churned_donors,
    AVG(last_month - first_month) AS average_months_before_churn
FROM spans
CROSS JOIN latest
WHERE as_of - last_month >= 12
"#;

pub const SQLITE_AVERAGE_MONTHS_BETWEEN_DONATIONS: &str = r#"
WITH months AS (
    SELECT
        donor_id,
        visit_date,
        CAST(strftime('%Y', visit_date) AS INTEGER) * 12
            + CAST(strftime('%m', visit_date) AS INTEGER) AS visit_month
    FROM {schema}.blood_donation_retention_2024
    WHERE visit_date IS NOT NULL
),
ordered AS (
    SELECT
        donor_id,
        visit_month,
        LAG(visit_month) OVER (PARTITION BY donor_id ORDER BY visit_date) AS previous_month
    FROM months
)
SELECT
    COUNT(DISTINCT donor_id) AS repeat_donors,
    AVG(visit_month - previous_month) AS average_months_between_donations
FROM ordered
WHERE previous_month IS NOT NULL
"#;

/// The production datamart set for a warehouse dialect, in build order
pub fn default_datamarts(dialect: SqlDialect) -> Vec<DatamartDefinition> {
    let [by_age_group, cohorts, before_churn, between_donations] = match dialect {
        SqlDialect::BigQuery => [
            GRANULAR_AVERAGE_DONATIONS_BY_AGE_GROUP,
            GRANULAR_COHORTS,
            GRANULAR_AVERAGE_MONTHS_BEFORE_CHURN_V2,
            GRANULAR_AVERAGE_MONTHS_BETWEEN_DONATIONS,
        ],
        SqlDialect::Sqlite => [
            SQLITE_AVERAGE_DONATIONS_BY_AGE_GROUP,
            SQLITE_COHORTS,
            SQLITE_AVERAGE_MONTHS_BEFORE_CHURN_V2,
            SQLITE_AVERAGE_MONTHS_BETWEEN_DONATIONS,
        ],
    };

    vec![
        DatamartDefinition::template(
            "granular_average_donations_by_age_group_query",
            by_age_group,
        ),
        DatamartDefinition::template("granular_cohorts_query", cohorts),
        DatamartDefinition::template(
            "granular_average_months_before_churn_query_v2",
            before_churn,
        ),
        DatamartDefinition::template(
            "granular_average_months_between_donations_query",
            between_donations,
        ),
    ]
}
