use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::PropertyType;

/// Identity of a listing across runs: the site it came from plus its detail URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub site: String,
    pub url: String,
}

/// One property listing as extracted from a search results page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: String,
    pub source_site: String,
    pub title: String,
    pub address: Option<String>,
    pub price: Option<u64>,
    pub property_type: Option<PropertyType>,
    pub size: Option<String>,
    pub url: String,
    pub description: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(source_site: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        let source_site = source_site.into();
        let url = url.into();
        Self {
            id: listing_id(&source_site, &url),
            source_site,
            title: title.into(),
            address: None,
            price: None,
            property_type: None,
            size: None,
            url,
            description: None,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = non_blank(address.into());
        self
    }

    pub fn with_price(mut self, price: Option<u64>) -> Self {
        self.price = price;
        self
    }

    pub fn with_property_type(mut self, property_type: Option<PropertyType>) -> Self {
        self.property_type = property_type;
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = non_blank(size.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = non_blank(description.into());
        self
    }

    pub fn discovered_at(mut self, at: DateTime<Utc>) -> Self {
        self.discovered_at = at;
        self
    }

    pub fn key(&self) -> ListingKey {
        ListingKey {
            site: self.source_site.clone(),
            url: self.url.clone(),
        }
    }

    /// A listing needs somewhere to click through to and something to call it.
    pub fn is_valid(&self) -> bool {
        !self.title.trim().is_empty()
            && (self.url.starts_with("https://") || self.url.starts_with("http://"))
    }

    /// Field-wise merge of a later sighting into this one. Later values win,
    /// but a field the later record lacks keeps the earlier value.
    pub fn absorb(&mut self, later: Listing) {
        if !later.title.trim().is_empty() {
            self.title = later.title;
        }
        if later.address.is_some() {
            self.address = later.address;
        }
        if later.price.is_some() {
            self.price = later.price;
        }
        if later.property_type.is_some() {
            self.property_type = later.property_type;
        }
        if later.size.is_some() {
            self.size = later.size;
        }
        if later.description.is_some() {
            self.description = later.description;
        }
        self.discovered_at = later.discovered_at;
    }
}

// stable across runs so the same (site, url) pair always gets the same id
fn listing_id(site: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(site.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn non_blank(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
