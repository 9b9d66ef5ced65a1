use crate::config::Config;
use crate::error::{Result, ScraperError};
use crate::types::{Lookup, Plate, RawListing};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const OCCASIONS_POINTER: &str = "/props/pageProps/initialState/searchReducer/occasions";

// Newer detail pages render the plate as a styled badge with a testid.
static PLATE_BADGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-testid="svg-Kenteken-([^"]+)""#).unwrap());

/// Client for the primary classifieds site: the search results page that
/// feeds the raw store, and the listing detail pages the plate is read from.
/// Both require the operator's session cookie.
pub struct GaspedaalClient {
    client: reqwest::Client,
    search_url: String,
    session_cookie: Option<String>,
}

impl GaspedaalClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.page_seconds))
            .build()?;
        Ok(Self {
            client,
            search_url: config.search.url.clone(),
            session_cookie: config.secrets.session_cookie.clone(),
        })
    }

    /// Fetches the configured search results page and returns one raw
    /// listing per occasion embedded in it.
    #[instrument(skip(self))]
    pub async fn scrape(&self) -> Result<Vec<RawListing>> {
        if self.session_cookie.is_none() {
            warn!("GASPEDAAL_COOKIE is not set; the search page may refuse the request");
        }
        let html = self.fetch_html(&self.search_url).await?;
        let listings = extract_raw_listings(&html)?;
        info!("Scraped {} raw listings from search page", listings.len());
        Ok(listings)
    }

    /// Resolves the license plate from a listing detail page. Every failure
    /// mode degrades to `Unavailable`; a missing plate never aborts a run.
    #[instrument(skip(self))]
    pub async fn resolve_plate(&self, detail_url: Option<&str>) -> Lookup<Plate> {
        let Some(url) = detail_url else {
            return Lookup::Unavailable("listing has no detail url".to_string());
        };
        match self.try_resolve_plate(url).await {
            Ok(Some(plate)) => Lookup::Found(plate),
            Ok(None) => {
                warn!("No plate found on detail page {}", url);
                Lookup::Unavailable("no plate found on detail page".to_string())
            }
            Err(e) => {
                warn!("Failed to resolve plate from {}: {}", url, e);
                Lookup::Unavailable(e.to_string())
            }
        }
    }

    async fn try_resolve_plate(&self, url: &str) -> Result<Option<Plate>> {
        let html = self.fetch_html(url).await?;
        Ok(extract_plate(&html).map(|raw| Plate::normalize(&raw)))
    }

    async fn fetch_html(&self, url: &str) -> Result<String> {
        let mut request = self.client.get(url);
        if let Some(cookie) = &self.session_cookie {
            request = request.header(reqwest::header::COOKIE, cookie.clone());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ScraperError::Api {
                message: format!("{} returned status {}", url, response.status()),
            });
        }
        Ok(response.text().await?)
    }
}

/// Walks the `__NEXT_DATA__` JSON island down to the occasion list.
/// Occasions without an external portal link are dropped: the detail URL is
/// the join key of the whole pipeline.
pub fn extract_raw_listings(html: &str) -> Result<Vec<RawListing>> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script#__NEXT_DATA__").unwrap();
    let script = document.select(&selector).next().ok_or_else(|| ScraperError::Api {
        message: "No __NEXT_DATA__ script found".to_string(),
    })?;

    let data: Value = serde_json::from_str(&script.inner_html())?;
    let occasions = data
        .pointer(OCCASIONS_POINTER)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let scraped_at = Utc::now();
    let mut listings = Vec::new();
    for occasion in &occasions {
        let url = occasion
            .get("portals")
            .and_then(Value::as_array)
            .and_then(|portals| {
                portals
                    .iter()
                    .find(|p| p.get("type").and_then(Value::as_str) == Some("other"))
            })
            .and_then(|portal| portal.get("url"))
            .and_then(Value::as_str);

        let Some(url) = url else {
            debug!("Skipping occasion without an external portal url");
            continue;
        };

        listings.push(RawListing {
            id: None,
            title: occasion
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string),
            price: text_field(occasion.get("price")),
            mileage: text_field(occasion.get("km")),
            url: url.to_string(),
            year: optional_text_field(occasion.get("year")),
            place: optional_text_field(occasion.get("place")),
            scraped_at,
        });
    }
    Ok(listings)
}

/// Extracts the raw plate token from a detail page. First the badge testid,
/// then the labelled table cell layout used by older pages.
pub fn extract_plate(html: &str) -> Option<String> {
    if let Some(captures) = PLATE_BADGE.captures(html) {
        return Some(captures[1].trim().to_string());
    }

    let document = Html::parse_document(html);
    let cell_selector = Selector::parse("td").unwrap();
    for cell in document.select(&cell_selector) {
        let label = cell.text().collect::<String>();
        if !label.trim().eq_ignore_ascii_case("kenteken") {
            continue;
        }
        for sibling in cell.next_siblings() {
            if let Some(value_cell) = ElementRef::wrap(sibling) {
                return Some(value_cell.text().collect::<String>().trim().to_string());
            }
        }
    }
    None
}

// The island serializes some fields as strings and some as numbers,
// depending on the page revision.
fn text_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn optional_text_field(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_PAGE: &str = r#"<html><body>
        <script id="__NEXT_DATA__" type="application/json">
        {"props":{"pageProps":{"initialState":{"searchReducer":{"occasions":[
            {"title":"Toyota Corolla Touring Sports 1.8 Hybrid Active",
             "price":"€ 18.750","km":104780,"year":2020,"place":"Den Haag",
             "portals":[{"type":"gaspedaal","url":"/toyota/corolla/1"},
                        {"type":"other","url":"https://example.com/v/corolla-1"}]},
            {"title":"Corolla without portal","price":"€ 1","km":"2",
             "portals":[{"type":"gaspedaal","url":"/toyota/corolla/2"}]}
        ]}}}}}
        </script></body></html>"#;

    #[test]
    fn extracts_occasions_from_the_next_data_island() {
        let listings = extract_raw_listings(SEARCH_PAGE).unwrap();
        assert_eq!(listings.len(), 1, "occasions without an external url are dropped");

        let listing = &listings[0];
        assert_eq!(listing.url, "https://example.com/v/corolla-1");
        assert_eq!(listing.price, "€ 18.750");
        assert_eq!(listing.mileage, "104780");
        assert_eq!(listing.year.as_deref(), Some("2020"));
        assert_eq!(listing.place.as_deref(), Some("Den Haag"));
    }

    #[test]
    fn missing_island_is_an_error() {
        assert!(extract_raw_listings("<html><body></body></html>").is_err());
    }

    #[test]
    fn plate_comes_from_the_badge_testid_when_present() {
        let html = r#"<svg data-testid="svg-Kenteken-H-401-ZX"></svg>"#;
        assert_eq!(extract_plate(html).as_deref(), Some("H-401-ZX"));
    }

    #[test]
    fn plate_falls_back_to_the_labelled_table_cell() {
        let html = r#"<table><tr>
            <td> Kenteken </td>
            <td> K-662-BD </td>
        </tr></table>"#;
        assert_eq!(extract_plate(html).as_deref(), Some("K-662-BD"));
    }

    #[test]
    fn no_plate_markup_yields_none() {
        assert_eq!(extract_plate("<p>Geen kenteken hier</p>"), None);
    }
}
