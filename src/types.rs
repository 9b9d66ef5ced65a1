use crate::apis::rdw::RegistryRecord;
use crate::error::Result;
use crate::llm::Recommendation;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A scraped listing as it came off the search results page. Append-only;
/// the URL is the join key to the normalized store but is not unique here,
/// since the same car may be scraped on several days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawListing {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub price: String,
    pub mileage: String,
    pub url: String,
    pub year: Option<String>,
    pub place: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

/// One enriched record per distinct listing URL, upsertable so a listing can
/// be re-enriched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedCar {
    pub url: String,
    pub name: String,
    pub price_num: i64,
    pub mileage_num: i64,
    pub plate: String,
    pub apk_expiry: Option<NaiveDate>,
    pub finnik_url: String,
    pub estimated_price: Option<i64>,
    pub llm_summary: String,
    pub llm_score: i64,
    pub normalized_at: DateTime<Utc>,
}

/// Normalized license-plate token: uppercase, separators stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plate(String);

impl Plate {
    /// Normalization is idempotent: feeding an already-normalized plate
    /// back in yields the same token.
    pub fn normalize(raw: &str) -> Self {
        Self(
            raw.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Plate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a best-effort enrichment step. `Unavailable` carries the
/// reason so the pipeline can log why a field is absent; it is never an
/// abort signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    Unavailable(String),
}

impl<T> Lookup<T> {
    pub fn found(&self) -> Option<&T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Unavailable(_) => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Unavailable(_) => None,
        }
    }
}

/// The integer formed by the digit characters of a scraped string:
/// "€ 19.948" -> 19948. Empty or digit-free input yields 0.
pub fn parse_numeric(raw: &str) -> i64 {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

static MODEL_NAME_FULL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d\.\d\s*Hybrid\s*[A-Za-z]+").unwrap());
static MODEL_NAME_SHORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"Hybrid\s*[A-Za-z]+").unwrap());

/// Extracts the model/trim fragment like "1.8 Hybrid Active" from a listing
/// title, falling back to the trimmed title itself.
pub fn extract_model_name(title: &str) -> String {
    if let Some(m) = MODEL_NAME_FULL.find(title) {
        return m.as_str().trim().to_string();
    }
    if let Some(m) = MODEL_NAME_SHORT.find(title) {
        return m.as_str().trim().to_string();
    }
    title.trim().to_string()
}

/// The external enrichment surface the pipeline runs each listing through.
/// The live implementation talks to the detail site, the registry, the
/// valuation provider, the secondary listing site and the LLM; tests stub it.
#[async_trait::async_trait]
pub trait EnrichmentApi: Send + Sync {
    /// Resolve the license plate from a listing detail page. Any fetch or
    /// parse failure degrades to `Unavailable`.
    async fn resolve_plate(&self, detail_url: Option<&str>) -> Lookup<Plate>;

    /// Merged registry record for a plate. Each sub-key degrades
    /// independently; the record itself is always returned in full shape.
    async fn registry_lookup(&self, plate: &Plate) -> RegistryRecord;

    /// On-the-road price for the plate's matching configuration.
    /// `Ok(None)` means the breakdown had no such line item; `Err` means a
    /// precondition of the valuation provider was violated.
    async fn valuation_lookup(
        &self,
        mileage: i64,
        plate: &Plate,
        model_name: &str,
    ) -> Result<Option<i64>>;

    /// Raw HTML of the secondary listing page for the plate.
    async fn secondary_page(&self, plate: &Plate) -> Lookup<String>;

    /// Public URL of the secondary listing page for the plate.
    fn secondary_page_url(&self, plate: &Plate) -> String;

    /// Purchase recommendation for the assembled record. Never fails:
    /// degrades to the sentinel summary/score.
    async fn recommend(
        &self,
        car: &serde_json::Value,
        registry: &RegistryRecord,
        secondary_html: Option<&str>,
    ) -> Recommendation;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plate_normalization_strips_separators_and_uppercases() {
        assert_eq!(Plate::normalize("AB-12-XY").as_str(), "AB12XY");
        assert_eq!(Plate::normalize("h-401-zx").as_str(), "H401ZX");
    }

    #[test]
    fn plate_normalization_is_idempotent() {
        let once = Plate::normalize("K-662-BD");
        let twice = Plate::normalize(once.as_str());
        assert_eq!(once, twice);
    }

    #[test]
    fn parse_numeric_keeps_digits_only() {
        assert_eq!(parse_numeric("€ 19.948,-"), 19948);
        assert_eq!(parse_numeric("104.780 km"), 104780);
        assert_eq!(parse_numeric(""), 0);
        assert_eq!(parse_numeric("n.o.t.k."), 0);
    }

    #[test]
    fn model_name_extraction_prefers_the_full_pattern() {
        assert_eq!(
            extract_model_name("Toyota Corolla Touring Sports 1.8 Hybrid Active | Org NL"),
            "1.8 Hybrid Active"
        );
        assert_eq!(extract_model_name("Corolla Hybrid Dynamic"), "Hybrid Dynamic");
        assert_eq!(extract_model_name("  Toyota Aygo X  "), "Toyota Aygo X");
    }

    #[test]
    fn unavailable_lookup_yields_none() {
        let lookup: Lookup<i64> = Lookup::Unavailable("timeout".to_string());
        assert_eq!(lookup.into_option(), None);
        assert_eq!(Lookup::Found(5).into_option(), Some(5));
    }
}
