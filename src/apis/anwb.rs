use crate::config::Config;
use crate::error::{Result, ScraperError};
use crate::types::Plate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const ON_THE_ROAD_ENTRY: &str = "Rijklaarprijs";

// Runs of uppercase latin / extended-latin letters; digits and punctuation
// in a model name carry no matching weight.
static SIGNIFICANT_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-ZÀ-ÖØ-Ý]+\b").unwrap());

// Provider taxonomy quirks: some configuration names spell the drivetrain
// differently than the listing sites do.
fn synonym(word: &str) -> Option<&'static str> {
    match word {
        "HYBRID" => Some("HEV"),
        _ => None,
    }
}

/// Valuation provider client. Resolves a plate to one of its registered
/// configurations by model-name match, then asks for the computed price
/// breakdown at the listing's mileage.
pub struct AnwbClient {
    client: reqwest::Client,
    base_url: String,
}

impl AnwbClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.valuation_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.endpoints.anwb_base.clone(),
        })
    }

    /// The "Rijklaarprijs" line item for the plate's matching configuration.
    /// `Ok(None)` when the breakdown has no such entry. Missing
    /// configuration data or a malformed admission date is an error: unlike
    /// the page lookups, this stage reports contract violations instead of
    /// swallowing them.
    #[instrument(skip(self), fields(plate = %plate))]
    pub async fn on_the_road_price(
        &self,
        mileage: i64,
        plate: &Plate,
        model_name: &str,
    ) -> Result<Option<i64>> {
        let items = self.configurations(plate).await?;
        let item = select_configuration(&items, model_name).ok_or_else(|| ScraperError::Api {
            message: format!("no configuration matching '{model_name}' for plate {plate}"),
        })?;
        let rate = self.ratelist(item, mileage, plate).await?;
        let price = extract_on_the_road_price(&rate);
        debug!("Valuation for {}: {:?}", plate, price);
        Ok(price)
    }

    async fn configurations(&self, plate: &Plate) -> Result<Vec<Value>> {
        let url = format!("{}/licensePlate/{}", self.base_url, plate);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ScraperError::Api {
                message: format!("configuration lookup returned status {}", response.status()),
            });
        }
        let value: Value = response.json().await?;
        value
            .as_array()
            .cloned()
            .ok_or_else(|| ScraperError::MissingField("configuration list".to_string()))
    }

    async fn ratelist(&self, item: &Value, mileage: i64, plate: &Plate) -> Result<Value> {
        let configuration_id = item
            .pointer("/configuration/id")
            .and_then(value_as_param)
            .ok_or_else(|| ScraperError::MissingField("configuration.id".to_string()))?;
        let original_price = item
            .pointer("/costs/originalListPrice")
            .and_then(value_as_i64)
            .ok_or_else(|| ScraperError::MissingField("costs.originalListPrice".to_string()))?;
        let options_price = item
            .pointer("/costs/optionsPrice")
            .and_then(value_as_i64)
            .ok_or_else(|| ScraperError::MissingField("costs.optionsPrice".to_string()))?;
        let admission = item
            .pointer("/history/firstInternationalAdmission")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ScraperError::MissingField("history.firstInternationalAdmission".to_string())
            })?;
        let (month, year) = split_admission(admission)?;

        let url = format!("{}/configuration/{}/ratelist", self.base_url, configuration_id);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("mileage", mileage.to_string()),
                ("configurationId", configuration_id.clone()),
                ("licensePlateYear", year.to_string()),
                ("licensePlateMonth", month.to_string()),
                ("newPrice", original_price.to_string()),
                ("licensePlate", plate.as_str().to_string()),
                ("optionsPrice", options_price.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ScraperError::Api {
                message: format!("ratelist request returned status {}", response.status()),
            });
        }
        Ok(response.json().await?)
    }
}

/// First configuration whose uppercased name contains every significant
/// word of the target model name (synonyms allowed). First match wins.
fn select_configuration<'a>(items: &'a [Value], model_name: &str) -> Option<&'a Value> {
    let words = significant_words(model_name);
    items.iter().find(|item| {
        item.pointer("/configuration/name")
            .and_then(Value::as_str)
            .map(|name| words_match(&name.to_uppercase(), &words))
            .unwrap_or(false)
    })
}

fn significant_words(model_name: &str) -> Vec<String> {
    let upper = model_name.to_uppercase();
    SIGNIFICANT_WORD
        .find_iter(&upper)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn words_match(configuration_name: &str, words: &[String]) -> bool {
    words.iter().all(|word| {
        configuration_name.contains(word.as_str())
            || synonym(word).is_some_and(|syn| configuration_name.contains(syn))
    })
}

// Admission dates arrive as "MM/YYYY". The format is a precondition of the
// ratelist request; anything else is reported upward as a contract break.
fn split_admission(admission: &str) -> Result<(u32, i32)> {
    let malformed = || ScraperError::Api {
        message: format!("malformed firstInternationalAdmission '{admission}', expected MM/YYYY"),
    };
    let (month, year) = admission.split_once('/').ok_or_else(malformed)?;
    let month: u32 = month.trim().parse().map_err(|_| malformed())?;
    let year: i32 = year.trim().parse().map_err(|_| malformed())?;
    Ok((month, year))
}

fn extract_on_the_road_price(rate: &Value) -> Option<i64> {
    rate.get("lists")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(ON_THE_ROAD_ENTRY))
        .and_then(|entry| entry.get("amount"))
        .and_then(value_as_i64)
}

fn value_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
}

fn value_as_param(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
