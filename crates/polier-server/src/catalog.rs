//! Supplier catalog and jobsite inventory, backed by SQLite.
//!
//! The tool layer treats these as synchronous lookups; every query runs
//! on the blocking pool behind an async facade.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use tokio::task;

#[derive(Debug, Clone, Serialize)]
pub struct CatalogProduct {
    pub artikel_id: String,
    pub artikelname: String,
    pub kategorie: Option<String>,
    pub einheit: Option<String>,
    pub preis_eur: Option<f64>,
    pub lieferant: Option<String>,
    pub lagerort: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryItem {
    pub artikel_id: String,
    pub artikelname: String,
    pub kategorie: Option<String>,
    pub lieferant: Option<String>,
    pub menge: Option<f64>,
}

#[derive(Clone)]
pub struct CatalogStore {
    db_path: PathBuf,
}

impl CatalogStore {
    pub fn initialize() -> anyhow::Result<Self> {
        Self::initialize_at(resolve_db_path())
    }

    pub fn initialize_at(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create catalog database directory: {}",
                    parent.display()
                )
            })?;
        }

        let conn = open_connection(&db_path)
            .with_context(|| format!("Failed to open catalog database: {}", db_path.display()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS artikel (
                artikel_id TEXT PRIMARY KEY,
                artikelname TEXT NOT NULL,
                kategorie TEXT NULL,
                einheit TEXT NULL,
                preis_eur REAL NULL,
                lieferant TEXT NULL,
                lagerort TEXT NULL
            );

            CREATE TABLE IF NOT EXISTS inventory (
                artikel_id TEXT PRIMARY KEY,
                artikelname TEXT NOT NULL,
                kategorie TEXT NULL,
                lieferant TEXT NULL,
                menge REAL NULL
            );

            CREATE INDEX IF NOT EXISTS idx_artikel_name ON artikel(artikelname);
            CREATE INDEX IF NOT EXISTS idx_inventory_name ON inventory(artikelname);
            "#,
        )
        .context("Failed to initialize catalog database schema")?;

        Ok(Self { db_path })
    }

    /// All distinct product names, sorted.
    pub async fn product_names(&self) -> anyhow::Result<Vec<String>> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare(
                r#"
                SELECT DISTINCT artikelname
                FROM artikel
                WHERE artikelname IS NOT NULL
                ORDER BY artikelname ASC
                "#,
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut names = Vec::new();
            for row in rows {
                names.push(row?);
            }
            Ok(names)
        })
        .await
    }

    /// Catalog products whose name loosely matches `query_text`
    /// (case-insensitive substring, whitespace treated as a wildcard),
    /// cheapest first.
    pub async fn products_matching(&self, query_text: &str) -> anyhow::Result<Vec<CatalogProduct>> {
        let pattern = loose_like_pattern(query_text);
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare(
                r#"
                SELECT artikel_id, artikelname, kategorie, einheit, preis_eur, lieferant, lagerort
                FROM artikel
                WHERE artikelname LIKE ?1 ESCAPE '\' COLLATE NOCASE
                ORDER BY preis_eur ASC NULLS LAST, artikelname ASC, artikel_id ASC
                "#,
            )?;
            let rows = stmt.query_map(params![pattern], map_product)?;
            let mut products = Vec::new();
            for row in rows {
                products.push(row?);
            }
            Ok(products)
        })
        .await
    }

    /// Inventory items whose name loosely matches `query_text`.
    pub async fn inventory_matching(&self, query_text: &str) -> anyhow::Result<Vec<InventoryItem>> {
        let pattern = loose_like_pattern(query_text);
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare(
                r#"
                SELECT artikel_id, artikelname, kategorie, lieferant, menge
                FROM inventory
                WHERE artikelname LIKE ?1 ESCAPE '\' COLLATE NOCASE
                ORDER BY artikelname ASC, artikel_id ASC
                "#,
            )?;
            let rows = stmt.query_map(params![pattern], map_inventory_item)?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(items)
        })
        .await
    }

    pub async fn upsert_product(&self, product: CatalogProduct) -> anyhow::Result<()> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO artikel (artikel_id, artikelname, kategorie, einheit, preis_eur, lieferant, lagerort)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(artikel_id) DO UPDATE SET
                    artikelname = excluded.artikelname,
                    kategorie = excluded.kategorie,
                    einheit = excluded.einheit,
                    preis_eur = excluded.preis_eur,
                    lieferant = excluded.lieferant,
                    lagerort = excluded.lagerort
                "#,
                params![
                    product.artikel_id,
                    product.artikelname,
                    product.kategorie,
                    product.einheit,
                    product.preis_eur,
                    product.lieferant,
                    product.lagerort,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_inventory_item(&self, item: InventoryItem) -> anyhow::Result<()> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO inventory (artikel_id, artikelname, kategorie, lieferant, menge)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(artikel_id) DO UPDATE SET
                    artikelname = excluded.artikelname,
                    kategorie = excluded.kategorie,
                    lieferant = excluded.lieferant,
                    menge = excluded.menge
                "#,
                params![
                    item.artikel_id,
                    item.artikelname,
                    item.kategorie,
                    item.lieferant,
                    item.menge,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn run_blocking<F, T>(&self, task_fn: F) -> anyhow::Result<T>
    where
        F: FnOnce(PathBuf) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || task_fn(db_path))
            .await
            .map_err(|err| anyhow!("Catalog worker failed: {err}"))?
    }
}

/// Turn freeform text into a loose `LIKE` pattern:
/// `"work gloves"` → `"%work%gloves%"`.
fn loose_like_pattern(query_text: &str) -> String {
    let mut pattern = String::with_capacity(query_text.len() + 8);
    pattern.push('%');
    let mut last_was_wildcard = true;
    for ch in query_text.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_wildcard {
                pattern.push('%');
                last_was_wildcard = true;
            }
            continue;
        }
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
        last_was_wildcard = false;
    }
    if !last_was_wildcard {
        pattern.push('%');
    }
    pattern
}

fn resolve_db_path() -> PathBuf {
    if let Ok(raw_path) = std::env::var("POLIER_CATALOG_DB_PATH") {
        let trimmed = raw_path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from("data/catalog.sqlite3")
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Unable to open SQLite database at {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(3))
        .context("Failed to configure SQLite busy timeout")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("Failed to enable SQLite WAL journal mode")?;
    Ok(conn)
}

fn map_product(row: &Row<'_>) -> rusqlite::Result<CatalogProduct> {
    Ok(CatalogProduct {
        artikel_id: row.get(0)?,
        artikelname: row.get(1)?,
        kategorie: row.get(2)?,
        einheit: row.get(3)?,
        preis_eur: row.get(4)?,
        lieferant: row.get(5)?,
        lagerort: row.get(6)?,
    })
}

fn map_inventory_item(row: &Row<'_>) -> rusqlite::Result<InventoryItem> {
    Ok(InventoryItem {
        artikel_id: row.get(0)?,
        artikelname: row.get(1)?,
        kategorie: row.get(2)?,
        lieferant: row.get(3)?,
        menge: row.get(4)?,
    })
}
