//! ETL Service - Consolidates customer-feedback extracts into the opinion warehouse
//!
//! Responsibilities:
//! - Extract the six CSV source files (clients, products, batch registry,
//!   social comments, surveys, web reviews)
//! - Load dimension tables idempotently and map names to surrogate ids
//! - Reconcile client/product references, synthesizing placeholder rows
//!   so no transactional fact is silently dropped
//! - Transform transactional rows into fact-table shape
//! - Load entity and fact tables inside a single transaction, skipping
//!   primary keys that already exist
//!
//! CRITICAL: the load must be IDEMPOTENT
//! Re-running over the same or overlapping extracts inserts each key at most once

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Loads customer-feedback extracts into the warehouse")]
struct Args {
    /// Directory containing the CSV extract files
    #[arg(long, default_value = "./csv")]
    data_dir: PathBuf,

    /// Dry run - read and transform everything, write nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
        })
    }
}

/// Load-batch labels attached to each fact source
const SURVEY_BATCH_LABEL: &str = "CSV";
const REVIEW_BATCH_LABEL: &str = "Web";

// =============================================================================
// Source extract rows (all fields read as text; typed parsing happens in the
// transform so a deserialization failure is genuinely structural)
// =============================================================================

#[derive(Debug, Deserialize)]
struct ClientRow {
    #[serde(rename = "IdCliente")]
    id: String,
    #[serde(rename = "Nombre")]
    name: String,
    #[serde(rename = "Email")]
    email: String,
}

#[derive(Debug, Deserialize)]
struct ProductRow {
    #[serde(rename = "IdProducto")]
    id: String,
    #[serde(rename = "Nombre")]
    name: String,
    #[serde(rename = "Categoría", alias = "Categoria")]
    category: String,
}

#[derive(Debug, Deserialize)]
struct BatchRow {
    #[serde(rename = "TipoFuente")]
    batch_type: String,
    #[serde(rename = "FechaCarga")]
    load_date: String,
}

#[derive(Debug, Deserialize)]
struct CommentRow {
    #[serde(rename = "IdComment")]
    id: String,
    #[serde(rename = "IdCliente")]
    client_id: String,
    #[serde(rename = "IdProducto")]
    product_id: String,
    #[serde(rename = "Fuente")]
    source: String,
    #[serde(rename = "Fecha")]
    timestamp: String,
    #[serde(rename = "comentario", alias = "Comentario")]
    text: String,
}

#[derive(Debug, Deserialize)]
struct SurveyRow {
    #[serde(rename = "IdOpinion")]
    id: String,
    #[serde(rename = "IdCliente")]
    client_id: String,
    #[serde(rename = "IdProducto")]
    product_id: String,
    #[serde(rename = "Fecha")]
    timestamp: String,
    #[serde(rename = "Comentario")]
    text: String,
    #[serde(rename = "Clasificacion", alias = "Clasificación")]
    classification: String,
    #[serde(rename = "PuntajeSatisfaccion")]
    satisfaction: String,
}

#[derive(Debug, Deserialize)]
struct ReviewRow {
    #[serde(rename = "IdReview")]
    id: String,
    #[serde(rename = "IdCliente")]
    client_id: String,
    #[serde(rename = "IdProducto")]
    product_id: String,
    #[serde(rename = "Fecha")]
    timestamp: String,
    #[serde(rename = "Comentario")]
    text: String,
    #[serde(rename = "Rating")]
    rating: String,
}

#[derive(Debug)]
struct Extracts {
    clients: Vec<ClientRow>,
    products: Vec<ProductRow>,
    batches: Vec<BatchRow>,
    comments: Vec<CommentRow>,
    surveys: Vec<SurveyRow>,
    reviews: Vec<ReviewRow>,
}

// =============================================================================
// In-memory warehouse records
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct ClientRecord {
    id: i64,
    name: String,
    email: String,
}

#[derive(Debug, Clone, PartialEq)]
struct ProductRecord {
    id: i64,
    name: String,
    category: Option<String>,
}

/// Product projected to target shape (category resolved to a surrogate id)
#[derive(Debug, Clone, PartialEq)]
struct ProductFinal {
    id: i64,
    name: String,
    category_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
struct BatchRecord {
    label: String,
    load_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
struct CommentFact {
    id: i64,
    client_id: i64,
    product_id: i64,
    source_id: i32,
    fecha: NaiveDateTime,
    text: String,
}

#[derive(Debug, Clone, PartialEq)]
struct SurveyFact {
    id: i64,
    client_id: i64,
    product_id: i64,
    batch_id: i32,
    fecha: NaiveDateTime,
    text: String,
    classification_id: i32,
    satisfaction: i32,
}

#[derive(Debug, Clone, PartialEq)]
struct ReviewFact {
    id: i64,
    client_id: i64,
    product_id: i64,
    batch_id: i32,
    fecha: NaiveDateTime,
    text: String,
    rating: f64,
}

/// Dimension name -> surrogate id mappings, queried once after the dimension
/// load and threaded explicitly through every transform step
#[derive(Debug, Default)]
struct IdMaps {
    category: HashMap<String, i32>,
    classification: HashMap<String, i32>,
    source: HashMap<String, i32>,
    batch: HashMap<String, i32>,
}

/// Everything ready for the warehouse-load phase, in FK dependency order
#[derive(Debug)]
struct Prepared {
    clients: Vec<ClientRecord>,
    products: Vec<ProductFinal>,
    comments: Vec<CommentFact>,
    surveys: Vec<SurveyFact>,
    reviews: Vec<ReviewFact>,
}

/// Rows actually inserted per table during one run
#[derive(Debug, Default)]
struct LoadReport {
    clientes: u64,
    productos: u64,
    comentarios: u64,
    encuestas: u64,
    web_reviews: u64,
}

/// Per-run data-quality counters: rows excluded before or during transform
#[derive(Debug, Default)]
struct RunStats {
    bad_client_rows: usize,
    bad_product_rows: usize,
    excluded_batches: usize,
    dropped_comments: usize,
    dropped_surveys: usize,
    dropped_reviews: usize,
    client_placeholders: usize,
    product_placeholders: usize,
    emails_rewritten: usize,
}

/// The end-of-run summary object: everything loaded, dropped, or
/// synthesized, in one place
fn run_summary(report: &LoadReport, stats: &RunStats) -> serde_json::Value {
    serde_json::json!({
        "loaded": {
            "clientes": report.clientes,
            "productos": report.productos,
            "comentarios": report.comentarios,
            "encuestas": report.encuestas,
            "web_reviews": report.web_reviews,
        },
        "dropped": {
            "clientes": stats.bad_client_rows,
            "productos": stats.bad_product_rows,
            "registro_cargas": stats.excluded_batches,
            "comentarios": stats.dropped_comments,
            "encuestas": stats.dropped_surveys,
            "web_reviews": stats.dropped_reviews,
        },
        "placeholders": {
            "clientes": stats.client_placeholders,
            "productos": stats.product_placeholders,
        },
        "emails_rewritten": stats.emails_rewritten,
    })
}

// =============================================================================
// IDENTIFIER NORMALIZER
// =============================================================================

/// Parse a raw key as an integer, accepting the float form pandas-era
/// extracts produce ("12.0"). Empty or non-numeric input yields None.
fn parse_key(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Some(n);
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 => Some(f as i64),
        _ => None,
    }
}

/// Strip an entity prefix ("C1023" -> 1023) and coerce to an integer id.
/// Pure and total: never fails, degrades to None.
///
/// NOTE: the prefix is removed by substring replacement, not checked as a
/// true leading prefix, so an id carrying the prefix character elsewhere is
/// mis-parsed ("1C2" -> 12). This matches the historical loader behavior;
/// changing it would silently re-key already-loaded facts.
fn clean_id(raw: &str, prefix: char) -> Option<i64> {
    parse_key(&raw.replace(prefix, ""))
}

// =============================================================================
// DATE PARSING
// =============================================================================

fn parse_load_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(d);
        }
    }
    None
}

fn parse_fecha(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt);
        }
    }
    parse_load_date(trimmed).and_then(|d| d.and_hms_opt(0, 0, 0))
}

// =============================================================================
// DIMENSION RESOLVER - pure extraction
// =============================================================================

/// Distinct non-empty values in first-seen order
fn distinct_values<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for value in values {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Deduplicate the batch registry by label (first occurrence wins) and
/// exclude rows whose load date does not parse. Returns the records plus
/// the number of excluded rows.
fn dedupe_batches(rows: &[BatchRow]) -> (Vec<BatchRecord>, usize) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    let mut excluded = 0;
    for row in rows {
        let label = row.batch_type.trim();
        if label.is_empty() {
            excluded += 1;
            continue;
        }
        if !seen.insert(label.to_string()) {
            continue;
        }
        match parse_load_date(&row.load_date) {
            Some(load_date) => out.push(BatchRecord {
                label: label.to_string(),
                load_date,
            }),
            None => excluded += 1,
        }
    }
    (out, excluded)
}

// =============================================================================
// REFERENTIAL RECONCILER
// =============================================================================

fn placeholder_email(id: i64) -> String {
    format!("cliente{}@mail.com", id)
}

/// Pure id -> placeholder record synthesis for clients referenced by
/// transactional data but absent from the client extract
fn placeholder_client(id: i64) -> ClientRecord {
    ClientRecord {
        id,
        name: format!("Cliente_{}", id),
        email: placeholder_email(id),
    }
}

fn placeholder_product(id: i64) -> ProductRecord {
    ProductRecord {
        id,
        name: format!("Producto_{}", id),
        category: None,
    }
}

/// Append a placeholder for every referenced client id missing from the
/// extract. Missing ids are visited in sorted order so placeholder rows are
/// deterministic across runs. Returns the number of placeholders created.
fn reconcile_clients(clients: &mut Vec<ClientRecord>, referenced: &HashSet<i64>) -> usize {
    let existing: HashSet<i64> = clients.iter().map(|c| c.id).collect();
    let missing: BTreeSet<i64> = referenced.difference(&existing).copied().collect();
    for &id in &missing {
        clients.push(placeholder_client(id));
    }
    missing.len()
}

fn reconcile_products(products: &mut Vec<ProductRecord>, referenced: &HashSet<i64>) -> usize {
    let existing: HashSet<i64> = products.iter().map(|p| p.id).collect();
    let missing: BTreeSet<i64> = referenced.difference(&existing).copied().collect();
    for &id in &missing {
        products.push(placeholder_product(id));
    }
    missing.len()
}

/// Enforce email uniqueness after placeholder insertion: every holder of a
/// shared email is rewritten to the id-qualified placeholder email. A
/// rewrite can itself land on an email another row already holds, so the
/// pass repeats until no email is shared. Each row changes at most once
/// (to its own id-qualified email, a fixed point), so this terminates.
/// Returns the number of rewritten rows.
fn enforce_unique_emails(clients: &mut [ClientRecord]) -> usize {
    let mut rewritten = 0;
    loop {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for client in clients.iter() {
            *counts.entry(client.email.as_str()).or_insert(0) += 1;
        }
        let shared: HashSet<String> = counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(email, _)| email.to_string())
            .collect();
        if shared.is_empty() {
            return rewritten;
        }

        let mut changed = false;
        for client in clients.iter_mut() {
            if shared.contains(&client.email) {
                let replacement = placeholder_email(client.id);
                if client.email != replacement {
                    client.email = replacement;
                    rewritten += 1;
                    changed = true;
                }
            }
        }
        // No progress means the remaining collisions are duplicate-id rows
        // holding identical placeholders; the key-based load dedups those
        if !changed {
            return rewritten;
        }
    }
}

// =============================================================================
// FACT TRANSFORMER
// =============================================================================

fn parse_clients(rows: &[ClientRow]) -> (Vec<ClientRecord>, usize) {
    let mut out = Vec::new();
    let mut dropped = 0;
    for row in rows {
        match clean_id(&row.id, 'C') {
            Some(id) => out.push(ClientRecord {
                id,
                name: row.name.trim().to_string(),
                email: row.email.trim().to_string(),
            }),
            None => dropped += 1,
        }
    }
    (out, dropped)
}

fn parse_products(rows: &[ProductRow]) -> (Vec<ProductRecord>, usize) {
    let mut out = Vec::new();
    let mut dropped = 0;
    for row in rows {
        match clean_id(&row.id, 'P') {
            Some(id) => {
                let category = row.category.trim();
                out.push(ProductRecord {
                    id,
                    name: row.name.trim().to_string(),
                    category: if category.is_empty() {
                        None
                    } else {
                        Some(category.to_string())
                    },
                });
            }
            None => dropped += 1,
        }
    }
    (out, dropped)
}

/// Resolve each product's category name to its surrogate id. An unmapped
/// category becomes NULL; the product row itself is kept.
fn resolve_product_categories(products: &[ProductRecord], maps: &IdMaps) -> Vec<ProductFinal> {
    products
        .iter()
        .map(|p| ProductFinal {
            id: p.id,
            name: p.name.clone(),
            category_id: p
                .category
                .as_deref()
                .and_then(|c| maps.category.get(c).copied()),
        })
        .collect()
}

/// Transform social comments into fact shape. A row failing any required
/// resolution (key, client/product reference, source mapping, timestamp)
/// is dropped and counted, never raised.
fn transform_comments(
    rows: &[CommentRow],
    maps: &IdMaps,
    valid_clients: &HashSet<i64>,
    valid_products: &HashSet<i64>,
) -> (Vec<CommentFact>, usize) {
    let mut facts = Vec::new();
    let mut dropped = 0;
    for row in rows {
        let fact = (|| {
            let id = parse_key(&row.id)?;
            let client_id = clean_id(&row.client_id, 'C').filter(|c| valid_clients.contains(c))?;
            let product_id =
                clean_id(&row.product_id, 'P').filter(|p| valid_products.contains(p))?;
            let source = row.source.trim();
            if source.is_empty() {
                return None;
            }
            let source_id = *maps.source.get(source)?;
            let fecha = parse_fecha(&row.timestamp)?;
            Some(CommentFact {
                id,
                client_id,
                product_id,
                source_id,
                fecha,
                text: row.text.trim().to_string(),
            })
        })();
        match fact {
            Some(f) => facts.push(f),
            None => dropped += 1,
        }
    }
    (facts, dropped)
}

fn transform_surveys(
    rows: &[SurveyRow],
    maps: &IdMaps,
    valid_clients: &HashSet<i64>,
    valid_products: &HashSet<i64>,
) -> (Vec<SurveyFact>, usize) {
    let mut facts = Vec::new();
    let mut dropped = 0;
    for row in rows {
        let fact = (|| {
            let id = parse_key(&row.id)?;
            let client_id = clean_id(&row.client_id, 'C').filter(|c| valid_clients.contains(c))?;
            let product_id =
                clean_id(&row.product_id, 'P').filter(|p| valid_products.contains(p))?;
            let classification = row.classification.trim();
            if classification.is_empty() {
                return None;
            }
            let classification_id = *maps.classification.get(classification)?;
            let batch_id = *maps.batch.get(SURVEY_BATCH_LABEL)?;
            let fecha = parse_fecha(&row.timestamp)?;
            let satisfaction = i32::try_from(parse_key(&row.satisfaction)?).ok()?;
            Some(SurveyFact {
                id,
                client_id,
                product_id,
                batch_id,
                fecha,
                text: row.text.trim().to_string(),
                classification_id,
                satisfaction,
            })
        })();
        match fact {
            Some(f) => facts.push(f),
            None => dropped += 1,
        }
    }
    (facts, dropped)
}

fn transform_reviews(
    rows: &[ReviewRow],
    maps: &IdMaps,
    valid_clients: &HashSet<i64>,
    valid_products: &HashSet<i64>,
) -> (Vec<ReviewFact>, usize) {
    let mut facts = Vec::new();
    let mut dropped = 0;
    for row in rows {
        let fact = (|| {
            let id = parse_key(&row.id)?;
            let client_id = clean_id(&row.client_id, 'C').filter(|c| valid_clients.contains(c))?;
            let product_id =
                clean_id(&row.product_id, 'P').filter(|p| valid_products.contains(p))?;
            let batch_id = *maps.batch.get(REVIEW_BATCH_LABEL)?;
            let fecha = parse_fecha(&row.timestamp)?;
            let rating = row.rating.trim().parse::<f64>().ok().filter(|r| r.is_finite())?;
            Some(ReviewFact {
                id,
                client_id,
                product_id,
                batch_id,
                fecha,
                text: row.text.trim().to_string(),
                rating,
            })
        })();
        match fact {
            Some(f) => facts.push(f),
            None => dropped += 1,
        }
    }
    (facts, dropped)
}

// =============================================================================
// IDEMPOTENT LOADER
// =============================================================================

/// The subset of rows whose key is not already present in the target table.
/// The query-then-filter check assumes a single writer; concurrent runs
/// could race past it (accepted limitation, see DESIGN.md).
fn rows_to_load<'a, T, K, F>(rows: &'a [T], existing: &HashSet<K>, key: F) -> Vec<&'a T>
where
    K: Eq + std::hash::Hash,
    F: Fn(&T) -> K,
{
    rows.iter().filter(|r| !existing.contains(&key(r))).collect()
}

fn report_pending(table: &str, total: usize, new: usize) {
    if total == 0 {
        println!("  No records to load for '{}'", table);
    } else if new == 0 {
        println!("  All {} records for '{}' already exist", total, table);
    } else {
        println!("  Loading {} new of {} records into '{}'", new, total, table);
    }
}

/// Load distinct dimension values, inserting only names not already present
async fn load_dimension(
    pool: &PgPool,
    table: &str,
    values: &[String],
    dry_run: bool,
) -> Result<u64> {
    if values.is_empty() {
        println!("  No values for dimension '{}'", table);
        return Ok(0);
    }

    let select = format!("SELECT nombre FROM {}", table);
    let existing: Vec<String> = sqlx::query_scalar(&select).fetch_all(pool).await?;
    let existing: HashSet<String> = existing.into_iter().collect();
    let new = rows_to_load(values, &existing, |v| v.clone());
    report_pending(table, values.len(), new.len());
    if new.is_empty() {
        return Ok(0);
    }
    if dry_run {
        println!("  Dry run - would insert {} values into '{}'", new.len(), table);
        return Ok(0);
    }

    let insert = format!("INSERT INTO {} (nombre) VALUES ($1)", table);
    for value in &new {
        sqlx::query(&insert).bind(value.as_str()).execute(pool).await?;
    }
    Ok(new.len() as u64)
}

/// Load the batch registry dimension (label + load date), keyed by label
async fn load_batch_registry(pool: &PgPool, batches: &[BatchRecord], dry_run: bool) -> Result<u64> {
    if batches.is_empty() {
        println!("  No values for dimension 'registro_cargas'");
        return Ok(0);
    }

    let existing: Vec<String> = sqlx::query_scalar("SELECT nombre FROM registro_cargas")
        .fetch_all(pool)
        .await?;
    let existing: HashSet<String> = existing.into_iter().collect();
    let new = rows_to_load(batches, &existing, |b| b.label.clone());
    report_pending("registro_cargas", batches.len(), new.len());
    if new.is_empty() {
        return Ok(0);
    }
    if dry_run {
        println!(
            "  Dry run - would insert {} values into 'registro_cargas'",
            new.len()
        );
        return Ok(0);
    }

    for batch in &new {
        sqlx::query("INSERT INTO registro_cargas (nombre, fecha_carga) VALUES ($1, $2)")
            .bind(&batch.label)
            .bind(batch.load_date)
            .execute(pool)
            .await?;
    }
    Ok(new.len() as u64)
}

/// Read back a dimension table into a name -> surrogate id map
async fn fetch_id_map(pool: &PgPool, table: &str, id_col: &str) -> Result<HashMap<String, i32>> {
    let sql = format!("SELECT {}, nombre FROM {}", id_col, table);
    let rows: Vec<(i32, String)> = sqlx::query_as(&sql).fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(id, name)| (name, id)).collect())
}

/// Build all four id maps. Failure here is fatal: the pipeline cannot
/// substitute surrogate keys without them.
async fn fetch_id_maps(pool: &PgPool) -> Result<IdMaps> {
    Ok(IdMaps {
        category: fetch_id_map(pool, "categorias", "id_categoria").await?,
        classification: fetch_id_map(pool, "clasificaciones", "id_clasificacion").await?,
        source: fetch_id_map(pool, "fuentes", "id_fuente").await?,
        batch: fetch_id_map(pool, "registro_cargas", "id_carga").await?,
    })
}

async fn existing_keys(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    pk: &str,
) -> Result<HashSet<i64>> {
    let sql = format!("SELECT {} FROM {}", pk, table);
    let ids: Vec<i64> = sqlx::query_scalar(&sql).fetch_all(&mut **tx).await?;
    Ok(ids.into_iter().collect())
}

async fn insert_clients(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[&ClientRecord],
) -> Result<u64> {
    for row in rows {
        sqlx::query("INSERT INTO clientes (id_cliente, nombre, email) VALUES ($1, $2, $3)")
            .bind(row.id)
            .bind(&row.name)
            .bind(&row.email)
            .execute(&mut **tx)
            .await?;
    }
    Ok(rows.len() as u64)
}

async fn insert_products(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[&ProductFinal],
) -> Result<u64> {
    for row in rows {
        sqlx::query("INSERT INTO productos (id_producto, nombre, id_categoria) VALUES ($1, $2, $3)")
            .bind(row.id)
            .bind(&row.name)
            .bind(row.category_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(rows.len() as u64)
}

async fn insert_comments(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[&CommentFact],
) -> Result<u64> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO comentarios (id_comment, id_cliente, id_producto, id_fuente, fecha, comentario)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(row.client_id)
        .bind(row.product_id)
        .bind(row.source_id)
        .bind(row.fecha)
        .bind(&row.text)
        .execute(&mut **tx)
        .await?;
    }
    Ok(rows.len() as u64)
}

async fn insert_surveys(tx: &mut Transaction<'_, Postgres>, rows: &[&SurveyFact]) -> Result<u64> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO encuestas
            (id_opinion, id_cliente, id_producto, id_carga, fecha, comentario, id_clasificacion, puntaje_satisfaccion)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(row.id)
        .bind(row.client_id)
        .bind(row.product_id)
        .bind(row.batch_id)
        .bind(row.fecha)
        .bind(&row.text)
        .bind(row.classification_id)
        .bind(row.satisfaction)
        .execute(&mut **tx)
        .await?;
    }
    Ok(rows.len() as u64)
}

async fn insert_reviews(tx: &mut Transaction<'_, Postgres>, rows: &[&ReviewFact]) -> Result<u64> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO web_reviews
            (id_review, id_cliente, id_producto, id_carga, fecha, comentario, rating)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(row.id)
        .bind(row.client_id)
        .bind(row.product_id)
        .bind(row.batch_id)
        .bind(row.fecha)
        .bind(&row.text)
        .bind(row.rating)
        .execute(&mut **tx)
        .await?;
    }
    Ok(rows.len() as u64)
}

/// Load entity and fact tables inside one transaction, in FK dependency
/// order. Any failure rolls the whole phase back; dimension loads committed
/// earlier are untouched.
async fn load_warehouse(pool: &PgPool, data: &Prepared) -> Result<LoadReport> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to open the fact-load transaction")?;
    let mut report = LoadReport::default();

    let existing = existing_keys(&mut tx, "clientes", "id_cliente").await?;
    let new = rows_to_load(&data.clients, &existing, |c| c.id);
    report_pending("clientes", data.clients.len(), new.len());
    report.clientes = insert_clients(&mut tx, &new)
        .await
        .context("Failed to load 'clientes'")?;

    let existing = existing_keys(&mut tx, "productos", "id_producto").await?;
    let new = rows_to_load(&data.products, &existing, |p| p.id);
    report_pending("productos", data.products.len(), new.len());
    report.productos = insert_products(&mut tx, &new)
        .await
        .context("Failed to load 'productos'")?;

    let existing = existing_keys(&mut tx, "comentarios", "id_comment").await?;
    let new = rows_to_load(&data.comments, &existing, |c| c.id);
    report_pending("comentarios", data.comments.len(), new.len());
    report.comentarios = insert_comments(&mut tx, &new)
        .await
        .context("Failed to load 'comentarios'")?;

    let existing = existing_keys(&mut tx, "encuestas", "id_opinion").await?;
    let new = rows_to_load(&data.surveys, &existing, |s| s.id);
    report_pending("encuestas", data.surveys.len(), new.len());
    report.encuestas = insert_surveys(&mut tx, &new)
        .await
        .context("Failed to load 'encuestas'")?;

    let existing = existing_keys(&mut tx, "web_reviews", "id_review").await?;
    let new = rows_to_load(&data.reviews, &existing, |r| r.id);
    report_pending("web_reviews", data.reviews.len(), new.len());
    report.web_reviews = insert_reviews(&mut tx, &new)
        .await
        .context("Failed to load 'web_reviews'")?;

    tx.commit()
        .await
        .context("Failed to commit the fact-load transaction")?;

    Ok(report)
}

// =============================================================================
// EXTRACTION
// =============================================================================

fn read_extract<T: serde::de::DeserializeOwned>(dir: &Path, file: &str) -> Result<Vec<T>> {
    let path = dir.join(file);
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(&path)
        .with_context(|| format!("Missing extract file: {}", path.display()))?;

    let mut rows = Vec::new();
    for result in reader.deserialize() {
        // A row that fails to deserialize means the column set is wrong,
        // which is structural and fatal
        let row: T =
            result.with_context(|| format!("Malformed extract file: {}", path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

fn extract_all(dir: &Path) -> Result<Extracts> {
    let extracts = Extracts {
        clients: read_extract(dir, "clients.csv")?,
        products: read_extract(dir, "products.csv")?,
        batches: read_extract(dir, "fuente_datos.csv")?,
        comments: read_extract(dir, "social_comments.csv")?,
        surveys: read_extract(dir, "surveys.csv")?,
        reviews: read_extract(dir, "web_reviews.csv")?,
    };
    println!("✓ All extract files loaded");
    println!("  clients: {} rows", extracts.clients.len());
    println!("  products: {} rows", extracts.products.len());
    println!("  fuente_datos: {} rows", extracts.batches.len());
    println!("  social_comments: {} rows", extracts.comments.len());
    println!("  surveys: {} rows", extracts.surveys.len());
    println!("  web_reviews: {} rows", extracts.reviews.len());
    Ok(extracts)
}

// =============================================================================
// MAIN - phase orchestration
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Opinion Warehouse ETL ===");
    println!("Data dir: {}", args.data_dir.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    // Phase 1: extract (before any database interaction, so a missing file
    // aborts without touching the warehouse)
    println!("\n=== Phase 1: Extracting source files ===");
    let extracts = extract_all(&args.data_dir)?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .context("Failed to connect to the warehouse")?;
    println!("✓ Connected to the warehouse");

    // Phase 2: dimension load (each failure is reported and skipped; the
    // mapping phase may still succeed off previously loaded rows)
    println!("\n=== Phase 2: Loading dimension tables ===");
    let categories = distinct_values(extracts.products.iter().map(|p| p.category.as_str()));
    let classifications =
        distinct_values(extracts.surveys.iter().map(|s| s.classification.as_str()));
    let sources = distinct_values(extracts.comments.iter().map(|c| c.source.as_str()));
    let (batches, excluded_batches) = dedupe_batches(&extracts.batches);
    if excluded_batches > 0 {
        println!("  Excluded {} batch registry rows (bad label or date)", excluded_batches);
    }

    for (table, values) in [
        ("categorias", &categories),
        ("clasificaciones", &classifications),
        ("fuentes", &sources),
    ] {
        match load_dimension(&pool, table, values, args.dry_run).await {
            Ok(n) => println!("✓ {}: {} new values", table, n),
            Err(e) => eprintln!("✗ Dimension load failed for '{}', skipping: {}", table, e),
        }
    }
    match load_batch_registry(&pool, &batches, args.dry_run).await {
        Ok(n) => println!("✓ registro_cargas: {} new values", n),
        Err(e) => eprintln!("✗ Dimension load failed for 'registro_cargas', skipping: {}", e),
    }

    // Phase 3: name -> surrogate id maps
    println!("\n=== Phase 3: Mapping dimension ids ===");
    let maps = fetch_id_maps(&pool)
        .await
        .context("Failed to build dimension id maps")?;
    println!(
        "✓ Maps ready: {} categorias, {} clasificaciones, {} fuentes, {} cargas",
        maps.category.len(),
        maps.classification.len(),
        maps.source.len(),
        maps.batch.len()
    );

    // Phase 4: referential reconciliation + fact transformation
    println!("\n=== Phase 4: Reconciling references and transforming facts ===");
    let (mut clients, bad_client_rows) = parse_clients(&extracts.clients);
    let (mut products, bad_product_rows) = parse_products(&extracts.products);
    if bad_client_rows + bad_product_rows > 0 {
        println!(
            "  Dropped {} client and {} product rows with unparseable ids",
            bad_client_rows, bad_product_rows
        );
    }

    let survey_client_refs: HashSet<i64> = extracts
        .surveys
        .iter()
        .filter_map(|s| clean_id(&s.client_id, 'C'))
        .collect();
    let product_refs: HashSet<i64> = extracts
        .surveys
        .iter()
        .map(|s| s.product_id.as_str())
        .chain(extracts.comments.iter().map(|c| c.product_id.as_str()))
        .chain(extracts.reviews.iter().map(|r| r.product_id.as_str()))
        .filter_map(|raw| clean_id(raw, 'P'))
        .collect();

    let client_placeholders = reconcile_clients(&mut clients, &survey_client_refs);
    let product_placeholders = reconcile_products(&mut products, &product_refs);
    if client_placeholders > 0 {
        println!("  Created {} client placeholders", client_placeholders);
    }
    if product_placeholders > 0 {
        println!("  Created {} product placeholders", product_placeholders);
    }
    let emails_rewritten = enforce_unique_emails(&mut clients);
    if emails_rewritten > 0 {
        println!("  Rewrote {} colliding client emails", emails_rewritten);
    }

    let valid_clients: HashSet<i64> = clients.iter().map(|c| c.id).collect();
    let valid_products: HashSet<i64> = products.iter().map(|p| p.id).collect();

    let products_final = resolve_product_categories(&products, &maps);
    let (comments, dropped_comments) =
        transform_comments(&extracts.comments, &maps, &valid_clients, &valid_products);
    let (surveys, dropped_surveys) =
        transform_surveys(&extracts.surveys, &maps, &valid_clients, &valid_products);
    let (reviews, dropped_reviews) =
        transform_reviews(&extracts.reviews, &maps, &valid_clients, &valid_products);
    println!(
        "✓ Transformed: {} comments ({} dropped), {} surveys ({} dropped), {} reviews ({} dropped)",
        comments.len(),
        dropped_comments,
        surveys.len(),
        dropped_surveys,
        reviews.len(),
        dropped_reviews
    );

    // Phase 5: warehouse load (single transaction, FK order)
    println!("\n=== Phase 5: Loading the warehouse ===");
    let report = if args.dry_run {
        println!("Dry run - skipping the warehouse load");
        LoadReport::default()
    } else {
        let prepared = Prepared {
            clients,
            products: products_final,
            comments,
            surveys,
            reviews,
        };
        match load_warehouse(&pool, &prepared).await {
            Ok(report) => report,
            Err(e) => {
                eprintln!("✗ Fact-load transaction rolled back: {}", e);
                return Err(e);
            }
        }
    };

    let stats = RunStats {
        bad_client_rows,
        bad_product_rows,
        excluded_batches,
        dropped_comments,
        dropped_surveys,
        dropped_reviews,
        client_placeholders,
        product_placeholders,
        emails_rewritten,
    };

    println!("\n=== ETL Complete ===");
    println!("Summary: {}", run_summary(&report, &stats));

    Ok(())
}

// =============================================================================
// TESTS - pure functions only, no warehouse connection required
// =============================================================================
