use crate::error::Result;
use crate::types::{NormalizedCar, RawListing};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Storage trait for the raw and normalized stores. The raw side is
/// append-only and partitioned by scrape date; the normalized side holds one
/// row per listing URL and is upserted so a listing can be re-enriched.
#[async_trait]
pub trait Storage: Send + Sync {
    // Raw listing operations
    async fn create_raw_listing(&self, listing: &mut RawListing) -> Result<()>;
    async fn get_raw_listings_for_date(&self, date: NaiveDate) -> Result<Vec<RawListing>>;

    // Normalized car operations
    async fn is_normalized(&self, url: &str) -> Result<bool>;
    async fn upsert_normalized_car(&self, car: &NormalizedCar) -> Result<()>;
    async fn get_normalized_car(&self, url: &str) -> Result<Option<NormalizedCar>>;
    async fn count_normalized_cars(&self) -> Result<u64>;
}

/// SQLite-backed storage. Schema is created idempotently at open.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS raw_listings (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                title       TEXT,
                price       TEXT NOT NULL,
                mileage     TEXT NOT NULL,
                url         TEXT NOT NULL,
                year        TEXT,
                place       TEXT,
                scraped_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_raw_listings_scraped_at
                ON raw_listings (scraped_at);
            CREATE TABLE IF NOT EXISTS normalized_cars (
                url             TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                price_num       INTEGER NOT NULL,
                mileage_num     INTEGER NOT NULL,
                plate           TEXT NOT NULL,
                apk_expiry      TEXT,
                finnik_url      TEXT NOT NULL,
                estimated_price INTEGER,
                llm_summary     TEXT NOT NULL,
                llm_score       INTEGER NOT NULL,
                normalized_at   TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_raw_listing(&self, listing: &mut RawListing) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO raw_listings (title, price, mileage, url, year, place, scraped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                listing.title,
                listing.price,
                listing.mileage,
                listing.url,
                listing.year,
                listing.place,
                listing.scraped_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ],
        )?;
        let id = conn.last_insert_rowid();
        listing.id = Some(id);
        debug!("Created raw listing {} for {}", id, listing.url);
        Ok(())
    }

    async fn get_raw_listings_for_date(&self, date: NaiveDate) -> Result<Vec<RawListing>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, price, mileage, url, year, place, scraped_at
             FROM raw_listings WHERE date(scraped_at) = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![date.format("%Y-%m-%d").to_string()], |row| {
            Ok(RawListing {
                id: Some(row.get(0)?),
                title: row.get(1)?,
                price: row.get(2)?,
                mileage: row.get(3)?,
                url: row.get(4)?,
                year: row.get(5)?,
                place: row.get(6)?,
                scraped_at: parse_timestamp(&row.get::<_, String>(7)?),
            })
        })?;

        let mut listings = Vec::new();
        for row in rows {
            listings.push(row?);
        }
        Ok(listings)
    }

    async fn is_normalized(&self, url: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM normalized_cars WHERE url = ?1")?;
        Ok(stmt.exists(params![url])?)
    }

    async fn upsert_normalized_car(&self, car: &NormalizedCar) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO normalized_cars
             (url, name, price_num, mileage_num, plate, apk_expiry, finnik_url,
              estimated_price, llm_summary, llm_score, normalized_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                car.url,
                car.name,
                car.price_num,
                car.mileage_num,
                car.plate,
                car.apk_expiry.map(|d| d.format("%Y-%m-%d").to_string()),
                car.finnik_url,
                car.estimated_price,
                car.llm_summary,
                car.llm_score,
                car.normalized_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ],
        )?;
        debug!("Upserted normalized car for {}", car.url);
        Ok(())
    }

    async fn get_normalized_car(&self, url: &str) -> Result<Option<NormalizedCar>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT url, name, price_num, mileage_num, plate, apk_expiry, finnik_url,
                    estimated_price, llm_summary, llm_score, normalized_at
             FROM normalized_cars WHERE url = ?1",
        )?;
        let mut rows = stmt.query_map(params![url], |row| {
            Ok(NormalizedCar {
                url: row.get(0)?,
                name: row.get(1)?,
                price_num: row.get(2)?,
                mileage_num: row.get(3)?,
                plate: row.get(4)?,
                apk_expiry: row
                    .get::<_, Option<String>>(5)?
                    .and_then(|raw| NaiveDate::parse_from_str(&raw, "%Y-%m-%d").ok()),
                finnik_url: row.get(6)?,
                estimated_price: row.get(7)?,
                llm_summary: row.get(8)?,
                llm_score: row.get(9)?,
                normalized_at: parse_timestamp(&row.get::<_, String>(10)?),
            })
        })?;

        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn count_normalized_cars(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM normalized_cars", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// In-memory storage implementation for development/testing
#[derive(Default)]
pub struct InMemoryStorage {
    raw_listings: Mutex<Vec<RawListing>>,
    normalized_cars: Mutex<HashMap<String, NormalizedCar>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_raw_listing(&self, listing: &mut RawListing) -> Result<()> {
        let mut raw_listings = self.raw_listings.lock().unwrap();
        listing.id = Some(raw_listings.len() as i64 + 1);
        raw_listings.push(listing.clone());
        Ok(())
    }

    async fn get_raw_listings_for_date(&self, date: NaiveDate) -> Result<Vec<RawListing>> {
        let raw_listings = self.raw_listings.lock().unwrap();
        Ok(raw_listings
            .iter()
            .filter(|listing| listing.scraped_at.date_naive() == date)
            .cloned()
            .collect())
    }

    async fn is_normalized(&self, url: &str) -> Result<bool> {
        Ok(self.normalized_cars.lock().unwrap().contains_key(url))
    }

    async fn upsert_normalized_car(&self, car: &NormalizedCar) -> Result<()> {
        self.normalized_cars
            .lock()
            .unwrap()
            .insert(car.url.clone(), car.clone());
        Ok(())
    }

    async fn get_normalized_car(&self, url: &str) -> Result<Option<NormalizedCar>> {
        Ok(self.normalized_cars.lock().unwrap().get(url).cloned())
    }

    async fn count_normalized_cars(&self) -> Result<u64> {
        Ok(self.normalized_cars.lock().unwrap().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_listing(url: &str) -> RawListing {
        RawListing {
            id: None,
            title: Some("Toyota Corolla 1.8 Hybrid Active".to_string()),
            price: "€ 18.750".to_string(),
            mileage: "104.780 km".to_string(),
            url: url.to_string(),
            year: Some("2020".to_string()),
            place: Some("Den Haag".to_string()),
            scraped_at: Utc::now(),
        }
    }

    fn sample_car(url: &str) -> NormalizedCar {
        NormalizedCar {
            url: url.to_string(),
            name: "1.8 Hybrid Active".to_string(),
            price_num: 18750,
            mileage_num: 104780,
            plate: "K662BD".to_string(),
            apk_expiry: NaiveDate::from_ymd_opt(2026, 6, 29),
            finnik_url: "https://finnik.nl/kenteken/K662BD/gratis".to_string(),
            estimated_price: Some(19050),
            llm_summary: "Solid buy".to_string(),
            llm_score: 78,
            normalized_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sqlite_round_trips_raw_listings_by_scrape_date() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();

        let mut listing = sample_listing("https://example.com/v/1");
        storage.create_raw_listing(&mut listing).await.unwrap();
        assert!(listing.id.is_some());

        let today = Utc::now().date_naive();
        let listings = storage.get_raw_listings_for_date(today).await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].url, "https://example.com/v/1");

        let other_day = today.pred_opt().unwrap();
        assert!(storage
            .get_raw_listings_for_date(other_day)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_raw_urls_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();

        let mut first = sample_listing("https://example.com/v/1");
        let mut second = sample_listing("https://example.com/v/1");
        storage.create_raw_listing(&mut first).await.unwrap();
        storage.create_raw_listing(&mut second).await.unwrap();

        let today = Utc::now().date_naive();
        assert_eq!(storage.get_raw_listings_for_date(today).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sqlite_upsert_replaces_on_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();

        let url = "https://example.com/v/1";
        storage.upsert_normalized_car(&sample_car(url)).await.unwrap();
        assert!(storage.is_normalized(url).await.unwrap());

        let mut updated = sample_car(url);
        updated.llm_score = 90;
        updated.estimated_price = None;
        storage.upsert_normalized_car(&updated).await.unwrap();

        assert_eq!(storage.count_normalized_cars().await.unwrap(), 1);
        let stored = storage.get_normalized_car(url).await.unwrap().unwrap();
        assert_eq!(stored.llm_score, 90);
        assert_eq!(stored.estimated_price, None);
        assert_eq!(stored.apk_expiry, NaiveDate::from_ymd_opt(2026, 6, 29));
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.upsert_normalized_car(&sample_car("u")).await.unwrap();
        }
        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(reopened.count_normalized_cars().await.unwrap(), 1);
    }
}
