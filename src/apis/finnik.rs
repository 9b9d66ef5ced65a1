use crate::config::Config;
use crate::error::{Result, ScraperError};
use crate::types::{Lookup, Plate};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{instrument, warn};

// The site serves an interstitial to clients that do not look like a
// browser, so every request carries a descriptive User-Agent.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0";

/// Client for the secondary listing site, used to refine the model/trim
/// name and to hand the vehicle-history page to the recommendation engine.
pub struct FinnikClient {
    client: reqwest::Client,
    base_url: String,
}

impl FinnikClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.page_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.endpoints.finnik_base.clone(),
        })
    }

    /// Public report URL recorded on the normalized row.
    pub fn page_url(&self, plate: &Plate) -> String {
        format!("{}/kenteken/{}/gratis", self.base_url, plate)
    }

    /// Raw HTML of the detail page for a plate. One fetch serves both the
    /// version-name refinement and the recommendation prompt.
    #[instrument(skip(self), fields(plate = %plate))]
    pub async fn fetch_page(&self, plate: &Plate) -> Lookup<String> {
        match self.try_fetch_page(plate).await {
            Ok(html) => Lookup::Found(html),
            Err(e) => {
                warn!("Secondary listing page unavailable for {}: {}", plate, e);
                Lookup::Unavailable(e.to_string())
            }
        }
    }

    async fn try_fetch_page(&self, plate: &Plate) -> Result<String> {
        let url = format!("{}/kenteken/", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("licensePlateNumber", plate.as_str())])
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ScraperError::Api {
                message: format!("detail page returned status {}", response.status()),
            });
        }
        Ok(response.text().await?)
    }
}

/// Reads the "Uitvoering" (trim/version) row from a detail page. Any miss
/// (no row, no value cell, empty text) yields the fallback name unchanged.
pub fn extract_version_name(html: &str, fallback: &str) -> String {
    let document = Html::parse_document(html);
    let row_selector = Selector::parse(".row").unwrap();
    let label_selector = Selector::parse(".label").unwrap();
    let value_selector = Selector::parse(".value").unwrap();

    for row in document.select(&row_selector) {
        let Some(label) = row.select(&label_selector).next() else {
            continue;
        };
        if !label.text().collect::<String>().contains("Uitvoering") {
            continue;
        }
        if let Some(value) = row.select(&value_selector).next() {
            let text = value.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return text;
            }
        }
    }
    fallback.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_name_comes_from_the_uitvoering_row() {
        let html = r#"
            <div class="row"><span class="label">Merk</span><span class="value">Toyota</span></div>
            <div class="row"><span class="label">Uitvoering</span><span class="value"> 1.8 Hybrid Business </span></div>
        "#;
        assert_eq!(
            extract_version_name(html, "1.8 Hybrid"),
            "1.8 Hybrid Business"
        );
    }

    #[test]
    fn missing_row_falls_back_to_the_original_name() {
        let html = r#"<div class="row"><span class="label">Merk</span><span class="value">Toyota</span></div>"#;
        assert_eq!(extract_version_name(html, "1.8 Hybrid Active"), "1.8 Hybrid Active");
    }

    #[test]
    fn row_without_a_value_cell_falls_back() {
        let html = r#"<div class="row"><span class="label">Uitvoering</span></div>"#;
        assert_eq!(extract_version_name(html, "original"), "original");
    }
}
