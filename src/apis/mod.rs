pub mod anwb;
pub mod finnik;
pub mod gaspedaal;
pub mod rdw;

use crate::config::Config;
use crate::error::Result;
use crate::llm::{LlmClient, Recommendation};
use crate::types::{EnrichmentApi, Lookup, Plate};
use rdw::RegistryRecord;
use serde_json::Value;

/// Production enrichment surface: one client per external collaborator,
/// each with its own request timeout.
pub struct LiveEnrichment {
    gaspedaal: gaspedaal::GaspedaalClient,
    rdw: rdw::RdwClient,
    anwb: anwb::AnwbClient,
    finnik: finnik::FinnikClient,
    llm: LlmClient,
}

impl LiveEnrichment {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            gaspedaal: gaspedaal::GaspedaalClient::new(config)?,
            rdw: rdw::RdwClient::new(config)?,
            anwb: anwb::AnwbClient::new(config)?,
            finnik: finnik::FinnikClient::new(config)?,
            llm: LlmClient::new(config)?,
        })
    }
}

#[async_trait::async_trait]
impl EnrichmentApi for LiveEnrichment {
    async fn resolve_plate(&self, detail_url: Option<&str>) -> Lookup<Plate> {
        self.gaspedaal.resolve_plate(detail_url).await
    }

    async fn registry_lookup(&self, plate: &Plate) -> RegistryRecord {
        self.rdw.fetch_registry(plate).await
    }

    async fn valuation_lookup(
        &self,
        mileage: i64,
        plate: &Plate,
        model_name: &str,
    ) -> Result<Option<i64>> {
        self.anwb.on_the_road_price(mileage, plate, model_name).await
    }

    async fn secondary_page(&self, plate: &Plate) -> Lookup<String> {
        self.finnik.fetch_page(plate).await
    }

    fn secondary_page_url(&self, plate: &Plate) -> String {
        self.finnik.page_url(plate)
    }

    async fn recommend(
        &self,
        car: &Value,
        registry: &RegistryRecord,
        secondary_html: Option<&str>,
    ) -> Recommendation {
        self.llm.recommend(car, registry, secondary_html).await
    }
}
