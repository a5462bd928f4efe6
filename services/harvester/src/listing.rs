//! Paginated product listing and the photo URLs derived from it.

use crate::config::ListingConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum ListingError {
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),

    #[error("Listing request for page {page} failed: {message}")]
    Request { page: u32, message: String },

    #[error("Failed to decode listing page {page}: {message}")]
    Decode { page: u32, message: String },
}

/// One car in a listing page
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListingItem {
    pub car_id: u64,
    /// Photo directory of the car
    pub photo: String,
    /// Number of photos published for the car
    pub pic_number: u32,
}

impl ListingItem {
    /// Large photo URLs, numbered from 1.
    pub fn image_urls(&self, photo_base_url: &str) -> Vec<String> {
        let base = photo_base_url.trim_end_matches('/');
        (1..=self.pic_number)
            .map(|n| format!("{}/{}/large/{}_{}.jpg", base, self.photo, self.car_id, n))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    items: Vec<ListingItem>,
}

/// Client for the products listing API
pub struct ListingClient {
    client: reqwest::Client,
    config: ListingConfig,
}

impl ListingClient {
    pub fn new(config: ListingConfig) -> Result<Self, ListingError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| ListingError::ClientBuild(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Fetch and decode one listing page.
    #[instrument(skip(self))]
    pub async fn fetch_page(&self, page: u32) -> Result<Vec<ListingItem>, ListingError> {
        let page_param = page.to_string();
        let query = [
            ("TypeID", "0"),
            ("ForRent", ""),
            ("Mans", ""),
            ("CurrencyID", "3"),
            ("MileageType", "1"),
            ("Page", page_param.as_str()),
        ];

        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&query)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ListingError::Request {
                page,
                message: e.to_string(),
            })?;

        let listing: ListingPage = response.json().await.map_err(|e| ListingError::Decode {
            page,
            message: e.to_string(),
        })?;

        debug!(items = listing.data.items.len(), "Listing page fetched");

        Ok(listing.data.items)
    }

    /// Photo URLs of every car on the configured pages.
    pub async fn collect_image_urls(&self) -> Result<Vec<String>, ListingError> {
        let mut urls = Vec::new();

        for page in self.config.page_range() {
            for item in self.fetch_page(page).await? {
                let item_urls = item.image_urls(&self.config.photo_base_url);
                debug!(car_id = item.car_id, photos = item_urls.len(), "Listed car");
                urls.extend(item_urls);
            }
        }

        info!(pages = self.config.pages, urls = urls.len(), "Collected image URLs");

        Ok(urls)
    }
}
