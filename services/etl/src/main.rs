//! ETL Service - Loads liquor purchase/sales data and refreshes the margin dashboard
//!
//! Responsibilities:
//! - Download the zipped purchases/sales CSV archives from the public source
//! - Extract the first CSV member of each archive
//! - Normalize both tables (dedup, filter, deterministic sample, snake_case columns)
//! - Replace the purchases/sales tables in Postgres and rebuild the margin views
//! - Import the Superset dashboard bundle once the service is reachable
//!
//! Usage:
//!   # Full run:
//!   cargo run --bin etl
//!
//!   # Download and normalize only, no database or Superset:
//!   cargo run --bin etl -- --dry-run
//!
//!   # Load the database but leave the dashboard alone:
//!   cargo run --bin etl -- --skip-import

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashSet;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Loads purchase/sales data into Postgres and imports the margin dashboard")]
struct Args {
    /// Directory for downloaded archives
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Path to the Superset dashboard export bundle
    #[arg(long, default_value = "/app/dashboards/dashboard_export_20250630T172417.zip")]
    dashboard: PathBuf,

    /// Skip the Superset dashboard import step
    #[arg(long, default_value = "false")]
    skip_import: bool,

    /// Dry run - download and normalize only, don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Configuration
// =============================================================================

const DATASET_BASE_URL: &str =
    "https://www.pwc.com/us/en/careers/university_relations/data_analytics_cases_studies/";

const DB_CONNECT_ATTEMPTS: usize = 5;
const DB_CONNECT_DELAY: Duration = Duration::from_secs(5);

const SERVICE_WAIT_ATTEMPTS: usize = 30;
const SERVICE_WAIT_DELAY: Duration = Duration::from_secs(10);

/// Fixed seed so the sales sample (and everything downstream of it) is
/// reproducible across runs.
const SAMPLE_SEED: u64 = 42;

const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
struct Config {
    db_user: String,
    db_password: String,
    db_host: String,
    db_name: String,
    superset_url: String,
    superset_username: String,
    superset_password: String,
    sales_entries_limit: usize,
}

impl Config {
    fn from_env() -> Self {
        Self {
            db_user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "annie".to_string()),
            db_password: std::env::var("POSTGRES_PASSWORD")
                .unwrap_or_else(|_| "annieMagicWord".to_string()),
            db_host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "db".to_string()),
            db_name: std::env::var("POSTGRES_DB").unwrap_or_else(|_| "liquor".to_string()),
            superset_url: std::env::var("SUPERSET_URL")
                .unwrap_or_else(|_| "http://superset:8088".to_string()),
            superset_username: std::env::var("SUPERSET_USERNAME")
                .unwrap_or_else(|_| "annie".to_string()),
            superset_password: std::env::var("SUPERSET_PASSWORD")
                .unwrap_or_else(|_| "annieMagicWord".to_string()),
            sales_entries_limit: std::env::var("SALES_ENTRIES_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
        }
    }

    fn database_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:5432/{}",
            self.db_user, self.db_password, self.db_host, self.db_name
        )
    }
}

// =============================================================================
// Retry helper - fixed-delay, bounded attempts
// =============================================================================

/// Run `op` up to `max_attempts` times with a fixed delay between attempts.
/// Returns the first success, or the last error once attempts are exhausted.
async fn retry_fixed<T, F, Fut>(max_attempts: usize, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                println!(
                    "  Attempt {}/{} failed: {}. Retrying in {}s...",
                    attempt,
                    max_attempts,
                    e,
                    delay.as_secs()
                );
                sleep(delay).await;
            }
        }
    }
}

// =============================================================================
// Remote Fetcher
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dataset {
    Purchases,
    Sales,
}

impl Dataset {
    fn archive_name(self) -> &'static str {
        match self {
            Dataset::Purchases => "PurchasesFINAL12312016csv.zip",
            Dataset::Sales => "SalesFINAL12312016csv.zip",
        }
    }
}

/// Download one dataset archive and persist it under the data directory.
/// Any HTTP or filesystem error aborts the whole run.
async fn download_archive(
    client: &reqwest::Client,
    base_url: &str,
    data_dir: &Path,
    dataset: Dataset,
) -> Result<PathBuf> {
    let url = format!("{}{}", base_url, dataset.archive_name());
    println!("  Fetching: {}", url);

    let resp = client
        .get(&url)
        .send()
        .await?
        .error_for_status()
        .context("HTTP request failed")?;

    let bytes = resp.bytes().await?;

    fs::create_dir_all(data_dir).await?;
    let path = data_dir.join(dataset.archive_name());
    fs::write(&path, &bytes).await?;

    println!("  Saved {} bytes to {}", bytes.len(), path.display());
    Ok(path)
}

// =============================================================================
// Dataset Extractor
// =============================================================================

/// Return the decoded content of the first `.csv` member of a zip archive.
fn first_csv_from_zip(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read archive {}", path.display()))?;
    first_csv_member(&data).with_context(|| format!("In archive {}", path.display()))
}

fn first_csv_member(data: &[u8]) -> Result<Vec<u8>> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(data)).context("Failed to open zip archive")?;

    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        if member.name().to_ascii_lowercase().ends_with(".csv") {
            let mut content = Vec::with_capacity(member.size() as usize);
            member.read_to_end(&mut content)?;
            return Ok(content);
        }
    }

    anyhow::bail!("No CSV member found in zip archive")
}

// =============================================================================
// Table Normalizer
// =============================================================================

/// Source row for the purchases dataset. Only the two projected columns are
/// named; the csv/serde reader ignores the rest.
#[derive(Debug, Deserialize)]
struct RawPurchaseRow {
    #[serde(rename = "InventoryId")]
    inventory_id: String,
    #[serde(rename = "PurchasePrice")]
    purchase_price: f64,
}

/// Canonical purchase record: one row per inventory id.
#[derive(Debug, Clone, PartialEq)]
struct Purchase {
    inventory_id: String,
    purchase_price: f64,
}

/// Source row for the sales dataset. Description, Size, Classification and
/// VendorNo are intentionally absent - they are dropped during normalization.
#[derive(Debug, Deserialize)]
struct RawSaleRow {
    #[serde(rename = "InventoryId")]
    inventory_id: String,
    #[serde(rename = "Store")]
    store: i32,
    #[serde(rename = "Brand")]
    brand: i32,
    #[serde(rename = "SalesQuantity")]
    sale_quantity: f64,
    #[serde(rename = "SalesDollars")]
    sale_amount: f64,
    #[serde(rename = "SalesPrice")]
    sale_price: f64,
    #[serde(rename = "SalesDate")]
    sale_date: String,
    #[serde(rename = "Volume")]
    product_volume: f64,
    #[serde(rename = "ExciseTax")]
    excise_tax: f64,
    #[serde(rename = "VendorName")]
    vendor_name: String,
}

/// Canonical sale record with snake_case naming and a typed sale date.
#[derive(Debug, Clone, PartialEq)]
struct Sale {
    inventory_id: String,
    store: i32,
    brand: i32,
    sale_date: NaiveDate,
    sale_price: f64,
    sale_amount: f64,
    product_volume: f64,
    excise_tax: f64,
    vendor_name: String,
    sale_quantity: f64,
}

/// Parse the purchases CSV, keeping the first occurrence of each inventory id.
/// This function is DETERMINISTIC: same input = same output.
fn normalize_purchases(content: &[u8]) -> Result<Vec<Purchase>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content);

    let mut seen: HashSet<String> = HashSet::new();
    let mut purchases = Vec::new();

    for (idx, result) in reader.deserialize().enumerate() {
        let raw: RawPurchaseRow =
            result.with_context(|| format!("Invalid purchases row at line {}", idx + 2))?;
        if seen.insert(raw.inventory_id.clone()) {
            purchases.push(Purchase {
                inventory_id: raw.inventory_id,
                purchase_price: raw.purchase_price,
            });
        }
    }

    Ok(purchases)
}

/// The source data carries both ISO and US-style dates depending on vintage.
fn parse_sale_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%m/%d/%Y"))
        .with_context(|| format!("Invalid sale date '{}'", value))
}

/// Parse the sales CSV, keep only rows with a known purchase inventory id,
/// and take a seeded sample of at most `limit` rows.
/// This function is DETERMINISTIC: same input = same output (fixed seed).
fn normalize_sales(
    content: &[u8],
    purchase_ids: &HashSet<String>,
    limit: usize,
) -> Result<Vec<Sale>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content);

    let mut rows = Vec::new();

    for (idx, result) in reader.deserialize().enumerate() {
        let raw: RawSaleRow =
            result.with_context(|| format!("Invalid sales row at line {}", idx + 2))?;

        // Only keep sales we have a purchase price for
        if !purchase_ids.contains(&raw.inventory_id) {
            continue;
        }

        let sale_date = parse_sale_date(&raw.sale_date)
            .with_context(|| format!("Sales row at line {}", idx + 2))?;

        rows.push(Sale {
            inventory_id: raw.inventory_id,
            store: raw.store,
            brand: raw.brand,
            sale_date,
            sale_price: raw.sale_price,
            sale_amount: raw.sale_amount,
            product_volume: raw.product_volume,
            excise_tax: raw.excise_tax,
            vendor_name: raw.vendor_name,
            sale_quantity: raw.sale_quantity,
        });
    }

    // Sample without replacement, capped at the available row count
    let amount = if limit > rows.len() {
        if !rows.is_empty() {
            eprintln!(
                "Warning: sample limit {} exceeds {} available sales rows; keeping all rows",
                limit,
                rows.len()
            );
        }
        rows.len()
    } else {
        limit
    };

    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    let picked = rand::seq::index::sample(&mut rng, rows.len(), amount);
    let sampled: Vec<Sale> = picked.iter().map(|i| rows[i].clone()).collect();

    Ok(sampled)
}

// =============================================================================
// Persistence Loader
// =============================================================================

const CREATE_PURCHASES_TABLE: &str = r#"
CREATE TABLE purchases (
    inventory_id TEXT NOT NULL,
    purchase_price DOUBLE PRECISION NOT NULL
)
"#;

const CREATE_SALES_TABLE: &str = r#"
CREATE TABLE sales (
    inventory_id TEXT NOT NULL,
    store INTEGER NOT NULL,
    brand INTEGER NOT NULL,
    sale_date DATE NOT NULL,
    sale_price DOUBLE PRECISION NOT NULL,
    sale_amount DOUBLE PRECISION NOT NULL,
    product_volume DOUBLE PRECISION NOT NULL,
    excise_tax DOUBLE PRECISION NOT NULL,
    vendor_name TEXT NOT NULL,
    sale_quantity DOUBLE PRECISION NOT NULL
)
"#;

const SALES_WITH_COSTS_VIEW: &str = r#"
CREATE MATERIALIZED VIEW sales_with_costs AS
SELECT
    s.*,
    p.purchase_price,
    ROUND((s.sale_quantity * p.purchase_price)::numeric, 2) as total_cost,
    ROUND((s.sale_amount - (s.sale_quantity * p.purchase_price))::numeric, 2) as gross_profit,
    ROUND(((s.sale_amount - (s.sale_quantity * p.purchase_price)) - s.excise_tax)::numeric, 2) as net_profit,
    CASE
        WHEN s.sale_amount > 0
            THEN ROUND(((s.sale_amount - (s.sale_quantity * p.purchase_price)) / s.sale_amount)::numeric, 2)
            ELSE 0
    END AS margin,
    CASE
        WHEN s.sale_amount > 0
            THEN ROUND((((s.sale_amount - (s.sale_quantity * p.purchase_price)) - s.excise_tax) / s.sale_amount)::numeric, 2)
            ELSE 0
    END AS net_margin
FROM
    sales s
JOIN purchases p
ON s.inventory_id = p.inventory_id
"#;

const PRODUCT_MARGINS_VIEW: &str = r#"
CREATE MATERIALIZED VIEW product_margins AS
SELECT
    s.brand,
    s.vendor_name,
    s.sale_price,
    s.excise_tax,
    p.purchase_price,
    ROUND((s.sale_price - p.purchase_price)::numeric, 2) as gross_profit,
    ROUND(((s.sale_price - p.purchase_price) - (s.excise_tax / s.sale_quantity))::numeric, 2) as net_profit,
    CASE
        WHEN s.sale_price > 0
            THEN ROUND(((s.sale_price - p.purchase_price) / s.sale_price)::numeric, 2)
        ELSE 0
    END AS margin,
    CASE
        WHEN s.sale_price > 0
            THEN ROUND((((s.sale_price - p.purchase_price) - (s.excise_tax / s.sale_quantity)) / s.sale_price)::numeric, 2)
        ELSE 0
    END AS net_margin
FROM
    sales s
JOIN purchases p
ON s.inventory_id = p.inventory_id
"#;

const MATERIALIZED_VIEWS: &[(&str, &str)] = &[
    ("sales_with_costs", SALES_WITH_COSTS_VIEW),
    ("product_margins", PRODUCT_MARGINS_VIEW),
];

/// Connect to Postgres with bounded retries and a liveness check per attempt.
async fn connect_with_retry(db_url: &str) -> Result<PgPool> {
    retry_fixed(DB_CONNECT_ATTEMPTS, DB_CONNECT_DELAY, |_| {
        let url = db_url.to_owned();
        async move {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            Ok(pool)
        }
    })
    .await
    .context("Failed to connect to database")
}

/// Drop both materialized views so the base tables can be replaced.
async fn drop_materialized_views(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (name, _) in MATERIALIZED_VIEWS {
        sqlx::query(&format!("DROP MATERIALIZED VIEW IF EXISTS {}", name))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Full-overwrite load of the purchases table.
async fn replace_purchases(pool: &PgPool, purchases: &[Purchase]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DROP TABLE IF EXISTS purchases").execute(&mut *tx).await?;
    sqlx::query(CREATE_PURCHASES_TABLE).execute(&mut *tx).await?;

    for chunk in purchases.chunks(INSERT_CHUNK_ROWS) {
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO purchases (inventory_id, purchase_price) ",
        );
        builder.push_values(chunk, |mut row, p| {
            row.push_bind(p.inventory_id.as_str())
                .push_bind(p.purchase_price);
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    println!("  Loaded {} purchase rows", purchases.len());
    Ok(())
}

/// Full-overwrite load of the sales table.
async fn replace_sales(pool: &PgPool, sales: &[Sale]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DROP TABLE IF EXISTS sales").execute(&mut *tx).await?;
    sqlx::query(CREATE_SALES_TABLE).execute(&mut *tx).await?;

    for chunk in sales.chunks(INSERT_CHUNK_ROWS) {
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO sales (inventory_id, store, brand, sale_date, sale_price, \
             sale_amount, product_volume, excise_tax, vendor_name, sale_quantity) ",
        );
        builder.push_values(chunk, |mut row, s| {
            row.push_bind(s.inventory_id.as_str())
                .push_bind(s.store)
                .push_bind(s.brand)
                .push_bind(s.sale_date)
                .push_bind(s.sale_price)
                .push_bind(s.sale_amount)
                .push_bind(s.product_volume)
                .push_bind(s.excise_tax)
                .push_bind(s.vendor_name.as_str())
                .push_bind(s.sale_quantity);
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    println!("  Loaded {} sales rows", sales.len());
    Ok(())
}

/// Rebuild the analysis views. Each view gets its own drop-then-create
/// transaction, committed explicitly, so a rerun is always idempotent.
async fn create_materialized_views(pool: &PgPool) -> Result<()> {
    for (name, create_sql) in MATERIALIZED_VIEWS {
        let mut tx = pool.begin().await?;
        sqlx::query(&format!("DROP MATERIALIZED VIEW IF EXISTS {}", name))
            .execute(&mut *tx)
            .await?;
        sqlx::query(create_sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create materialized view {}", name))?;
        tx.commit().await?;
        println!("  Created materialized view: {}", name);
    }
    Ok(())
}

/// Load the normalized tables and rebuild the derived views.
/// Not atomic across steps - a crash mid-load is repaired by the next run.
async fn load_tables(pool: &PgPool, purchases: &[Purchase], sales: &[Sale]) -> Result<()> {
    println!("Loading data into database...");
    drop_materialized_views(pool).await?;
    replace_purchases(pool, purchases).await?;
    replace_sales(pool, sales).await?;
    create_materialized_views(pool).await?;
    Ok(())
}

// =============================================================================
// Dashboard Importer (Superset)
// =============================================================================

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CsrfResponse {
    result: String,
}

/// Imports a pre-built dashboard bundle into Superset. Construction is
/// side-effect free; `run` drives wait -> login -> csrf -> import.
struct SupersetImporter {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    database_password: String,
    access_token: Option<String>,
    csrf_token: Option<String>,
}

impl SupersetImporter {
    fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.superset_url.clone(),
            username: config.superset_username.clone(),
            password: config.superset_password.clone(),
            database_password: config.db_password.clone(),
            access_token: None,
            csrf_token: None,
        }
    }

    async fn run(&mut self, bundle: &Path) -> Result<()> {
        self.wait_for_service().await?;
        self.login().await?;
        self.fetch_csrf_token().await?;
        self.import_dashboard(bundle).await?;
        Ok(())
    }

    /// Poll the health endpoint until Superset answers 200.
    async fn wait_for_service(&self) -> Result<()> {
        let health_url = format!("{}/health", self.base_url);

        retry_fixed(SERVICE_WAIT_ATTEMPTS, SERVICE_WAIT_DELAY, |attempt| {
            let client = self.client.clone();
            let url = health_url.clone();
            async move {
                println!(
                    "  Waiting for Superset... attempt {}/{}",
                    attempt, SERVICE_WAIT_ATTEMPTS
                );
                let resp = client.get(&url).send().await?;
                if resp.status() != reqwest::StatusCode::OK {
                    anyhow::bail!("health check returned {}", resp.status());
                }
                Ok(())
            }
        })
        .await
        .with_context(|| format!("Superset at {} did not become available", self.base_url))?;

        println!("  Superset at {} is up", self.base_url);
        Ok(())
    }

    async fn login(&mut self) -> Result<()> {
        let url = format!("{}/api/v1/security/login", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
                "provider": "db",
                "refresh": true,
            }))
            .send()
            .await?;

        if resp.status() != reqwest::StatusCode::OK {
            anyhow::bail!("Got HTTP {} from {}; expected 200", resp.status(), url);
        }

        let body: LoginResponse = resp.json().await.context("Malformed login response")?;
        self.access_token = Some(body.access_token);
        println!("  Received access token");
        Ok(())
    }

    async fn fetch_csrf_token(&mut self) -> Result<()> {
        let token = self
            .access_token
            .as_deref()
            .context("Login must run before the CSRF token fetch")?;

        // Trailing slash required to avoid a redirect
        let url = format!("{}/api/v1/security/csrf_token/", self.base_url);
        let resp = self.client.get(&url).bearer_auth(token).send().await?;

        if resp.status() != reqwest::StatusCode::OK {
            anyhow::bail!("Got HTTP {} from {}; expected 200", resp.status(), url);
        }

        let body: CsrfResponse = resp.json().await.context("Malformed CSRF response")?;
        self.csrf_token = Some(body.result);
        println!("  Received CSRF token");
        Ok(())
    }

    /// Fresh passwords map per call, keyed by the datasource config filename
    /// inside the bundle.
    fn datasource_passwords(&self) -> serde_json::Value {
        serde_json::json!({ "databases/PostgreSQL.yaml": self.database_password })
    }

    /// Upload the bundle. A missing bundle file is a warning, not an error -
    /// returns whether an import actually happened.
    async fn import_dashboard(&self, bundle: &Path) -> Result<bool> {
        if !bundle.exists() {
            eprintln!(
                "Warning: dashboard bundle not found at {}; skipping import",
                bundle.display()
            );
            return Ok(false);
        }

        let token = self
            .access_token
            .as_deref()
            .context("Login must run before the dashboard import")?;
        let csrf = self
            .csrf_token
            .as_deref()
            .context("CSRF token must be fetched before the dashboard import")?;

        let url = format!("{}/api/v1/dashboard/import/", self.base_url);
        let bytes = fs::read(bundle)
            .await
            .with_context(|| format!("Failed to read dashboard bundle {}", bundle.display()))?;

        let file_part = reqwest::multipart::Part::bytes(bytes)
            .file_name("dashboard.zip")
            .mime_str("application/zip")?;
        let form = reqwest::multipart::Form::new()
            .part("formData", file_part)
            .text("passwords", self.datasource_passwords().to_string())
            .text("overwrite", "true");

        self.client
            .post(&url)
            .bearer_auth(token)
            .header("X-CSRFToken", csrf)
            .multipart(form)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("Dashboard import to {} failed", url))?;

        println!("  Dashboard imported");
        Ok(true)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

async fn run(args: &Args, config: &Config) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;

    // Extract
    println!("\nDownloading source archives from {}", DATASET_BASE_URL);
    let purchases_zip =
        download_archive(&client, DATASET_BASE_URL, &args.data_dir, Dataset::Purchases).await?;
    let sales_zip =
        download_archive(&client, DATASET_BASE_URL, &args.data_dir, Dataset::Sales).await?;

    // Transform
    println!("\nNormalizing datasets...");
    let purchases = normalize_purchases(&first_csv_from_zip(&purchases_zip)?)?;
    println!("  Purchases: {} unique inventory ids", purchases.len());

    let purchase_ids: HashSet<String> =
        purchases.iter().map(|p| p.inventory_id.clone()).collect();
    let sales = normalize_sales(
        &first_csv_from_zip(&sales_zip)?,
        &purchase_ids,
        config.sales_entries_limit,
    )?;
    println!("  Sales: {} rows after filter and sample", sales.len());

    if args.dry_run {
        println!("\nDry run - skipping database load and dashboard import");
        return Ok(());
    }

    // Load
    println!("\nConnecting to database at {}...", config.db_host);
    let pool = connect_with_retry(&config.database_url()).await?;
    load_tables(&pool, &purchases, &sales).await?;
    println!("ETL process completed successfully!");

    // Dashboard
    if args.skip_import {
        println!("Skipping Superset dashboard import (--skip-import)");
        return Ok(());
    }

    let mut importer = SupersetImporter::new(client, config);
    importer.run(&args.dashboard).await?;
    println!("Superset dashboard imported successfully!");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env();

    println!("=== Liquor Margin ETL ===");

    if let Err(e) = run(&args, &config).await {
        eprintln!("Error during pipeline: {:#}", e);
        return Err(e);
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // -------------------------------------------------------------------------
    // FIXTURES
    // -------------------------------------------------------------------------

    fn make_zip(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in members {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    const SALES_HEADER: &str = "InventoryId,Store,Brand,Description,Size,SalesQuantity,\
                                SalesDollars,SalesPrice,SalesDate,Volume,Classification,\
                                ExciseTax,VendorNo,VendorName";

    fn sales_csv(rows: &[String]) -> Vec<u8> {
        let mut csv = String::from(SALES_HEADER);
        csv.push('\n');
        for row in rows {
            csv.push_str(row);
            csv.push('\n');
        }
        csv.into_bytes()
    }

    fn sales_row(inventory_id: &str, date: &str) -> String {
        format!(
            "{},1,100,Some Bottle,750mL,2,16.00,8.00,{},750,1,1.00,7,Vendor Inc",
            inventory_id, date
        )
    }

    fn id_set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    // -------------------------------------------------------------------------
    // DATASET EXTRACTOR
    // -------------------------------------------------------------------------

    #[test]
    fn test_first_csv_member_wins() {
        let data = make_zip(&[
            ("readme.txt", b"not tabular".as_slice()),
            ("first.csv", b"a,b\n1,2\n".as_slice()),
            ("second.csv", b"c,d\n3,4\n".as_slice()),
        ]);
        let content = first_csv_member(&data).unwrap();
        assert_eq!(content, b"a,b\n1,2\n");
    }

    #[test]
    fn test_csv_extension_case_insensitive() {
        let data = make_zip(&[("DATA.CSV", b"a,b\n1,2\n".as_slice())]);
        let content = first_csv_member(&data).unwrap();
        assert_eq!(content, b"a,b\n1,2\n");
    }

    #[test]
    fn test_no_csv_member_errors() {
        let data = make_zip(&[("readme.txt", b"nope".as_slice())]);
        let result = first_csv_member(&data);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("No CSV member"));
    }

    // -------------------------------------------------------------------------
    // PURCHASES NORMALIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_purchases_projection_and_rename() {
        let csv = b"InventoryId,Store,PurchasePrice,VendorName\n1_HARDERSFIELD_58,1,10.00,Vendor\n";
        let purchases = normalize_purchases(csv).unwrap();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].inventory_id, "1_HARDERSFIELD_58");
        assert_eq!(purchases[0].purchase_price, 10.00);
    }

    #[test]
    fn test_purchases_dedup_keeps_first_occurrence() {
        let csv = b"InventoryId,PurchasePrice\nA,10.00\nB,20.00\nA,99.00\n";
        let purchases = normalize_purchases(csv).unwrap();
        assert_eq!(purchases.len(), 2);
        assert_eq!(purchases[0].inventory_id, "A");
        assert_eq!(purchases[0].purchase_price, 10.00);
        assert_eq!(purchases[1].inventory_id, "B");
    }

    #[test]
    fn test_purchases_normalization_idempotent() {
        let csv = b"InventoryId,PurchasePrice\nA,10.00\nB,20.00\nA,99.00\nC,5.50\n";
        let first = normalize_purchases(csv).unwrap();
        let second = normalize_purchases(csv).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_purchases_invalid_price_is_fatal() {
        let csv = b"InventoryId,PurchasePrice\nA,not-a-number\n";
        assert!(normalize_purchases(csv).is_err());
    }

    #[test]
    fn test_purchases_empty_input() {
        let csv = b"InventoryId,PurchasePrice\n";
        let purchases = normalize_purchases(csv).unwrap();
        assert!(purchases.is_empty());
    }

    // -------------------------------------------------------------------------
    // SALES NORMALIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_sales_filtered_to_purchase_ids() {
        let csv = sales_csv(&[
            sales_row("A", "2024-01-01"),
            sales_row("UNKNOWN", "2024-01-02"),
            sales_row("B", "2024-01-03"),
        ]);
        let ids = id_set(&["A", "B"]);
        let sales = normalize_sales(&csv, &ids, 100).unwrap();

        assert_eq!(sales.len(), 2);
        for sale in &sales {
            assert!(ids.contains(&sale.inventory_id));
        }
    }

    #[test]
    fn test_sales_row_fields_normalized() {
        let csv = sales_csv(&[sales_row("A", "2024-01-01")]);
        let sales = normalize_sales(&csv, &id_set(&["A"]), 10).unwrap();

        let sale = &sales[0];
        assert_eq!(sale.inventory_id, "A");
        assert_eq!(sale.store, 1);
        assert_eq!(sale.brand, 100);
        assert_eq!(sale.sale_date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(sale.sale_price, 8.00);
        assert_eq!(sale.sale_amount, 16.00);
        assert_eq!(sale.product_volume, 750.0);
        assert_eq!(sale.excise_tax, 1.00);
        assert_eq!(sale.vendor_name, "Vendor Inc");
        assert_eq!(sale.sale_quantity, 2.0);
    }

    #[test]
    fn test_sales_sampling_deterministic() {
        let rows: Vec<String> = (0..100)
            .map(|i| sales_row(&format!("ID{}", i), "2024-01-01"))
            .collect();
        let csv = sales_csv(&rows);
        let ids: HashSet<String> = (0..100).map(|i| format!("ID{}", i)).collect();

        let first = normalize_sales(&csv, &ids, 10).unwrap();
        let second = normalize_sales(&csv, &ids, 10).unwrap();

        assert_eq!(first.len(), 10);
        // Same rows in the same order
        assert_eq!(first, second);
    }

    #[test]
    fn test_sales_sampling_caps_at_available_rows() {
        let csv = sales_csv(&[
            sales_row("A", "2024-01-01"),
            sales_row("B", "2024-01-02"),
            sales_row("C", "2024-01-03"),
        ]);
        let sales = normalize_sales(&csv, &id_set(&["A", "B", "C"]), 1_000_000).unwrap();
        assert_eq!(sales.len(), 3);
    }

    #[test]
    fn test_sales_sample_is_subset_without_duplicates() {
        let rows: Vec<String> = (0..50)
            .map(|i| sales_row(&format!("ID{}", i), "2024-01-01"))
            .collect();
        let csv = sales_csv(&rows);
        let ids: HashSet<String> = (0..50).map(|i| format!("ID{}", i)).collect();

        let sales = normalize_sales(&csv, &ids, 20).unwrap();
        assert_eq!(sales.len(), 20);

        let picked: HashSet<String> = sales.iter().map(|s| s.inventory_id.clone()).collect();
        assert_eq!(picked.len(), 20);
    }

    #[test]
    fn test_sales_empty_after_filter() {
        let csv = sales_csv(&[sales_row("UNKNOWN", "2024-01-01")]);
        let sales = normalize_sales(&csv, &id_set(&["A"]), 10).unwrap();
        assert!(sales.is_empty());
    }

    #[test]
    fn test_sale_date_iso_format() {
        assert_eq!(
            parse_sale_date("2024-01-01").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
    }

    #[test]
    fn test_sale_date_us_format() {
        assert_eq!(
            parse_sale_date("1/31/2016").unwrap(),
            NaiveDate::from_ymd_opt(2016, 1, 31).unwrap()
        );
    }

    #[test]
    fn test_sale_date_invalid_is_fatal() {
        assert!(parse_sale_date("yesterday").is_err());

        let csv = sales_csv(&[sales_row("A", "not-a-date")]);
        assert!(normalize_sales(&csv, &id_set(&["A"]), 10).is_err());
    }

    // -------------------------------------------------------------------------
    // RETRY POLICY
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_succeeds_on_fifth_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retry_fixed(5, Duration::ZERO, move |_| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 5 {
                    anyhow::bail!("connection refused");
                }
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 5);
        // Exactly five attempts, no sixth
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error_after_exhaustion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_fixed(3, Duration::ZERO, move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("failure {}", attempt)
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().to_string(), "failure 3");
    }

    #[tokio::test]
    async fn test_retry_first_success_makes_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retry_fixed(5, Duration::ZERO, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // -------------------------------------------------------------------------
    // CONFIGURATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_database_url_assembly() {
        let config = Config {
            db_user: "annie".to_string(),
            db_password: "annieMagicWord".to_string(),
            db_host: "db".to_string(),
            db_name: "liquor".to_string(),
            superset_url: "http://superset:8088".to_string(),
            superset_username: "annie".to_string(),
            superset_password: "annieMagicWord".to_string(),
            sales_entries_limit: 1_000_000,
        };
        assert_eq!(
            config.database_url(),
            "postgresql://annie:annieMagicWord@db:5432/liquor"
        );
    }

    // -------------------------------------------------------------------------
    // DASHBOARD IMPORTER
    // -------------------------------------------------------------------------

    fn test_importer() -> SupersetImporter {
        // Unroutable base URL: any HTTP call in these tests would fail fast
        SupersetImporter {
            client: reqwest::Client::new(),
            base_url: "http://127.0.0.1:9".to_string(),
            username: "annie".to_string(),
            password: "annieMagicWord".to_string(),
            database_password: "dbSecret".to_string(),
            access_token: None,
            csrf_token: None,
        }
    }

    #[tokio::test]
    async fn test_import_skips_missing_bundle_without_http() {
        let importer = test_importer();
        let imported = importer
            .import_dashboard(Path::new("/nonexistent/dashboard_export.zip"))
            .await
            .unwrap();
        assert!(!imported);
    }

    #[test]
    fn test_datasource_passwords_keyed_by_config_filename() {
        let importer = test_importer();
        let passwords = importer.datasource_passwords();
        assert_eq!(passwords["databases/PostgreSQL.yaml"], "dbSecret");
        assert_eq!(passwords.as_object().unwrap().len(), 1);
    }

    // -------------------------------------------------------------------------
    // VIEW SQL SANITY
    // -------------------------------------------------------------------------

    #[test]
    fn test_view_sql_guards_zero_denominators() {
        // Both margin expressions fall back to 0 instead of dividing by zero
        assert!(SALES_WITH_COSTS_VIEW.contains("WHEN s.sale_amount > 0"));
        assert!(PRODUCT_MARGINS_VIEW.contains("WHEN s.sale_price > 0"));
        assert_eq!(SALES_WITH_COSTS_VIEW.matches("ELSE 0").count(), 2);
        assert_eq!(PRODUCT_MARGINS_VIEW.matches("ELSE 0").count(), 2);
    }

    #[test]
    fn test_view_names_match_drop_list() {
        for (name, sql) in MATERIALIZED_VIEWS {
            assert!(sql.contains(&format!("CREATE MATERIALIZED VIEW {}", name)));
        }
    }

    #[test]
    fn test_archive_names() {
        assert_eq!(
            Dataset::Purchases.archive_name(),
            "PurchasesFINAL12312016csv.zip"
        );
        assert_eq!(Dataset::Sales.archive_name(), "SalesFINAL12312016csv.zip");
    }
}
