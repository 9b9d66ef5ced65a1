use crate::config::Config;
use crate::error::{Result, ScraperError};
use crate::types::Plate;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{instrument, warn};

// Open-data datasets merged into one registry record, keyed by plate.
const VEHICLE_INFO_PATH: &str = "/resource/m9d7-ebf2.json";
const AXLE_INFO_PATH: &str = "/resource/8ys7-d773.json";
const FUEL_INFO_PATH: &str = "/resource/8n4e-qkew.json";
const BODY_INFO_PATH: &str = "/resource/vezc-m2t6.json";
const VEHICLE_CLASS_INFO_PATH: &str = "/resource/95zd-6z5x.json";

/// Merged registry data for one plate. The five sub-keys are opaque
/// enrichment blobs passed through to the prompt; a failed sub-lookup leaves
/// an empty mapping in place, never a missing key. Callers must read absence
/// as "unknown", not "error".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRecord {
    #[serde(rename = "voertuigInfo")]
    pub vehicle_info: Value,
    #[serde(rename = "assenInfo")]
    pub axle_info: Value,
    #[serde(rename = "brandstofInfo")]
    pub fuel_info: Value,
    #[serde(rename = "carrosserieInfo")]
    pub body_info: Value,
    #[serde(rename = "voertuigklasseInfo")]
    pub vehicle_class_info: Value,
}

impl Default for RegistryRecord {
    fn default() -> Self {
        Self {
            vehicle_info: empty_mapping(),
            axle_info: empty_mapping(),
            fuel_info: empty_mapping(),
            body_info: empty_mapping(),
            vehicle_class_info: empty_mapping(),
        }
    }
}

fn empty_mapping() -> Value {
    Value::Object(serde_json::Map::new())
}

impl RegistryRecord {
    /// APK (MOT) expiry from the vehicle-info record. The registry publishes
    /// both an ISO datetime (`vervaldatum_apk_dt`) and a compact `YYYYMMDD`
    /// field; either is accepted.
    pub fn apk_expiry(&self) -> Option<NaiveDate> {
        let record = self.vehicle_info.get(0)?;

        if let Some(dt) = record.get("vervaldatum_apk_dt").and_then(Value::as_str) {
            if let Some(date_part) = dt.split('T').next() {
                if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
                    return Some(date);
                }
            }
        }

        let compact = record.get("vervaldatum_apk").and_then(Value::as_str)?;
        NaiveDate::parse_from_str(compact, "%Y%m%d").ok()
    }
}

pub struct RdwClient {
    client: reqwest::Client,
    base_url: String,
}

impl RdwClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.registry_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.endpoints.rdw_base.clone(),
        })
    }

    /// Queries the five datasets concurrently and merges the results. Every
    /// sub-request completes (or degrades) before the record is returned;
    /// there is no partial early return.
    #[instrument(skip(self), fields(plate = %plate))]
    pub async fn fetch_registry(&self, plate: &Plate) -> RegistryRecord {
        let (vehicle_info, axle_info, fuel_info, body_info, vehicle_class_info) = tokio::join!(
            self.fetch_dataset(VEHICLE_INFO_PATH, plate),
            self.fetch_dataset(AXLE_INFO_PATH, plate),
            self.fetch_dataset(FUEL_INFO_PATH, plate),
            self.fetch_dataset(BODY_INFO_PATH, plate),
            self.fetch_dataset(VEHICLE_CLASS_INFO_PATH, plate),
        );

        RegistryRecord {
            vehicle_info,
            axle_info,
            fuel_info,
            body_info,
            vehicle_class_info,
        }
    }

    async fn fetch_dataset(&self, path: &str, plate: &Plate) -> Value {
        match self.try_fetch_dataset(path, plate).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Registry dataset {} unavailable for {}: {}", path, plate, e);
                empty_mapping()
            }
        }
    }

    async fn try_fetch_dataset(&self, path: &str, plate: &Plate) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(&[("kenteken", plate.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ScraperError::Api {
                message: format!("{} returned status {}", path, response.status()),
            });
        }

        Ok(response.json().await?)
    }
}
