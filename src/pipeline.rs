use crate::apis::finnik::extract_version_name;
use crate::apis::gaspedaal::GaspedaalClient;
use crate::apis::rdw::RegistryRecord;
use crate::config::Config;
use crate::error::{Result, ScraperError};
use crate::storage::Storage;
use crate::types::{
    extract_model_name, parse_numeric, EnrichmentApi, Lookup, NormalizedCar, RawListing,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Result of a complete normalize run.
#[derive(Debug, Serialize)]
pub struct NormalizeRunResult {
    pub total_listings: usize,
    pub normalized: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Fetches the search page and appends every occasion to the raw store.
pub async fn scrape_into_store(
    client: &GaspedaalClient,
    storage: Arc<dyn Storage>,
) -> Result<usize> {
    let mut listings = client.scrape().await?;
    for listing in &mut listings {
        storage.create_raw_listing(listing).await?;
    }
    Ok(listings.len())
}

/// Walks today's raw batch and enriches every listing that has no
/// normalized row yet. Listings are processed strictly one at a time; the
/// only concurrency underneath is the registry lookup's internal fan-out.
pub struct Normalizer {
    storage: Arc<dyn Storage>,
    enrichment: Arc<dyn EnrichmentApi>,
    delay: Duration,
    admission: Semaphore,
}

impl Normalizer {
    pub fn new(
        storage: Arc<dyn Storage>,
        enrichment: Arc<dyn EnrichmentApi>,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            enrichment,
            delay: Duration::from_millis(config.pipeline.delay_ms),
            // Single-slot admission gate: at most one listing in flight.
            admission: Semaphore::new(1),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<NormalizeRunResult> {
        let today = Utc::now().date_naive();
        let listings = self.storage.get_raw_listings_for_date(today).await?;
        info!(
            "Normalizing {} raw listings scraped on {}",
            listings.len(),
            today
        );

        let mut normalized = 0;
        let mut skipped = 0;
        let mut errors = Vec::new();

        for (i, listing) in listings.iter().enumerate() {
            // Existence check before any enrichment work: re-running over an
            // already-normalized batch must not hit the third parties again.
            if self.storage.is_normalized(&listing.url).await? {
                debug!("Already normalized, skipping {}", listing.url);
                skipped += 1;
                continue;
            }

            let permit = self.admission.acquire().await.map_err(|_| ScraperError::Api {
                message: "admission gate closed".to_string(),
            })?;
            let outcome = self.normalize_listing(listing).await;
            drop(permit);

            match outcome {
                Ok(car) => {
                    self.storage.upsert_normalized_car(&car).await?;
                    info!("Normalized {} (score {})", car.url, car.llm_score);
                    normalized += 1;
                }
                Err(e) => {
                    warn!("Failed to normalize {}: {}", listing.url, e);
                    errors.push(format!("{}: {}", listing.url, e));
                }
            }

            if i + 1 < listings.len() && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        Ok(NormalizeRunResult {
            total_listings: listings.len(),
            normalized,
            skipped,
            errors,
        })
    }

    #[instrument(skip(self, listing), fields(url = %listing.url))]
    async fn normalize_listing(&self, listing: &RawListing) -> Result<NormalizedCar> {
        let price_num = parse_numeric(&listing.price);
        let mileage_num = parse_numeric(&listing.mileage);
        let original_name = extract_model_name(listing.title.as_deref().unwrap_or(""));

        let plate = match self.enrichment.resolve_plate(Some(listing.url.as_str())).await {
            Lookup::Found(plate) => Some(plate),
            Lookup::Unavailable(reason) => {
                warn!("Plate unavailable for {}: {}", listing.url, reason);
                None
            }
        };

        let registry = match &plate {
            Some(plate) => self.enrichment.registry_lookup(plate).await,
            None => RegistryRecord::default(),
        };

        let secondary = match &plate {
            Some(plate) => self.enrichment.secondary_page(plate).await,
            None => Lookup::Unavailable("plate unresolved".to_string()),
        };
        let name = match secondary.found() {
            Some(html) => extract_version_name(html, &original_name),
            None => original_name.clone(),
        };

        let estimated_price = match &plate {
            Some(plate) => {
                match self
                    .enrichment
                    .valuation_lookup(mileage_num, plate, &name)
                    .await
                {
                    Ok(Some(price)) => Some(price),
                    Ok(None) => {
                        debug!("Valuation breakdown has no on-the-road entry for {plate}");
                        None
                    }
                    Err(e) => {
                        warn!("Valuation unavailable for {plate}: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        let mut car = NormalizedCar {
            url: listing.url.clone(),
            name,
            price_num,
            mileage_num,
            plate: plate
                .as_ref()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default(),
            apk_expiry: registry.apk_expiry(),
            finnik_url: plate
                .as_ref()
                .map(|p| self.enrichment.secondary_page_url(p))
                .unwrap_or_default(),
            estimated_price,
            llm_summary: String::new(),
            llm_score: 0,
            normalized_at: Utc::now(),
        };

        let recommendation = self
            .enrichment
            .recommend(
                &prompt_payload(listing, &car),
                &registry,
                secondary.found().map(String::as_str),
            )
            .await;
        car.llm_summary = recommendation.llm_summary;
        car.llm_score = recommendation.llm_score;

        Ok(car)
    }
}

/// Listing fields the recommendation prompt sees: the raw scrape joined
/// with everything enriched so far.
fn prompt_payload(listing: &RawListing, car: &NormalizedCar) -> Value {
    json!({
        "title": listing.title,
        "price": listing.price,
        "mileage": listing.mileage,
        "url": listing.url,
        "year": listing.year,
        "place": listing.place,
        "name": car.name,
        "priceNum": car.price_num,
        "mileageNum": car.mileage_num,
        "plate": car.plate,
        "apkExpiry": car.apk_expiry,
        "finnikUrl": car.finnik_url,
        "estimatedPrice": car.estimated_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_payload_joins_raw_and_enriched_fields() {
        let listing = RawListing {
            id: Some(1),
            title: Some("Toyota Corolla 1.8 Hybrid Active".to_string()),
            price: "€ 18.750".to_string(),
            mileage: "104.780 km".to_string(),
            url: "https://example.com/v/1".to_string(),
            year: Some("2020".to_string()),
            place: None,
            scraped_at: Utc::now(),
        };
        let car = NormalizedCar {
            url: listing.url.clone(),
            name: "1.8 Hybrid Active".to_string(),
            price_num: 18750,
            mileage_num: 104780,
            plate: "K662BD".to_string(),
            apk_expiry: None,
            finnik_url: "https://finnik.nl/kenteken/K662BD/gratis".to_string(),
            estimated_price: Some(19050),
            llm_summary: String::new(),
            llm_score: 0,
            normalized_at: Utc::now(),
        };

        let payload = prompt_payload(&listing, &car);
        assert_eq!(payload["price"], "€ 18.750");
        assert_eq!(payload["priceNum"], 18750);
        assert_eq!(payload["estimatedPrice"], 19050);
        assert_eq!(payload["place"], Value::Null);
    }
}
