use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{CrawlerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Office,
    Retail,
    Industrial,
    #[serde(rename = "Multi-Family", alias = "MultiFamily", alias = "Multifamily", alias = "Investment")]
    MultiFamily,
    Land,
    Hotel,
}

impl PropertyType {
    pub const ALL: [PropertyType; 6] = [
        PropertyType::Office,
        PropertyType::Retail,
        PropertyType::Industrial,
        PropertyType::MultiFamily,
        PropertyType::Land,
        PropertyType::Hotel,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PropertyType::Office => "Office",
            PropertyType::Retail => "Retail",
            PropertyType::Industrial => "Industrial",
            PropertyType::MultiFamily => "Multi-Family",
            PropertyType::Land => "Land",
            PropertyType::Hotel => "Hotel",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PropertyType {
    type Err = CrawlerError;

    /// Lenient match used for both CLI input and text scraped off listing cards.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();

        match normalized.as_str() {
            "office" => Ok(PropertyType::Office),
            "retail" => Ok(PropertyType::Retail),
            "industrial" | "flex" | "warehouse" => Ok(PropertyType::Industrial),
            "multifamily" | "apartments" | "investment" => Ok(PropertyType::MultiFamily),
            "land" => Ok(PropertyType::Land),
            "hotel" | "hospitality" => Ok(PropertyType::Hotel),
            _ => Err(CrawlerError::Validation(format!("unknown property type '{}'", s.trim()))),
        }
    }
}

/// What to search for. Built by the caller, validated once, then cloned into
/// each scraper task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub property_types: BTreeSet<PropertyType>,
    pub location: String,
    #[serde(default)]
    pub min_price: Option<u64>,
    #[serde(default)]
    pub max_price: Option<u64>,
    pub lookback_days: u32,
    pub target_sites: Vec<String>,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            property_types: [PropertyType::Office, PropertyType::Retail, PropertyType::Industrial]
                .into_iter()
                .collect(),
            location: "Seattle, WA".to_string(),
            min_price: None,
            max_price: None,
            lookback_days: 1,
            target_sites: vec!["commercialmls".to_string(), "loopnet".to_string()],
        }
    }
}

impl SearchCriteria {
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(CrawlerError::Validation(format!(
                    "minimum price {} exceeds maximum price {}",
                    min, max
                )));
            }
        }
        if self.lookback_days == 0 {
            return Err(CrawlerError::Validation(
                "lookback window must be at least one day".to_string(),
            ));
        }
        if self.location.trim().is_empty() {
            return Err(CrawlerError::Validation("location cannot be blank".to_string()));
        }
        Ok(())
    }

    /// Nothing to search for; a run with these criteria does no work.
    pub fn is_noop(&self) -> bool {
        self.property_types.is_empty() || self.target_sites.is_empty()
    }

    /// First day of the lookback window.
    pub fn listed_since(&self, today: NaiveDate) -> NaiveDate {
        today - ChronoDuration::days(i64::from(self.lookback_days))
    }

    /// `listed_since` relative to the local calendar, in the `MM/DD/YYYY`
    /// form both sites' date pickers accept.
    pub fn listed_since_text(&self) -> String {
        self.listed_since(Local::now().date_naive())
            .format("%m/%d/%Y")
            .to_string()
    }

    /// Canonical site keys: `LoopNet.com` and `loopnet` both map to `loopnet`.
    /// Order is preserved and duplicates removed.
    pub fn site_keys(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.target_sites
            .iter()
            .map(|site| normalize_site_key(site))
            .filter(|key| !key.is_empty() && seen.insert(key.clone()))
            .collect()
    }
}

pub fn normalize_site_key(site: &str) -> String {
    let trimmed = site
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.");
    trimmed
        .split('.')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_criteria_is_valid() {
        let criteria = SearchCriteria::default();
        assert!(criteria.validate().is_ok());
        assert!(!criteria.is_noop());
        assert_eq!(criteria.site_keys(), vec!["commercialmls", "loopnet"]);
    }

    #[test]
    fn test_inverted_price_range_rejected() {
        let criteria = SearchCriteria {
            min_price: Some(2_000_000),
            max_price: Some(500_000),
            ..SearchCriteria::default()
        };
        assert!(matches!(criteria.validate(), Err(CrawlerError::Validation(_))));
    }

    #[test]
    fn test_equal_price_bounds_accepted() {
        let criteria = SearchCriteria {
            min_price: Some(750_000),
            max_price: Some(750_000),
            ..SearchCriteria::default()
        };
        assert!(criteria.validate().is_ok());
    }

    #[test]
    fn test_zero_lookback_rejected() {
        let criteria = SearchCriteria {
            lookback_days: 0,
            ..SearchCriteria::default()
        };
        assert!(criteria.validate().is_err());
    }

    #[test]
    fn test_empty_selection_is_noop_not_error() {
        let criteria = SearchCriteria {
            property_types: BTreeSet::new(),
            ..SearchCriteria::default()
        };
        assert!(criteria.validate().is_ok());
        assert!(criteria.is_noop());

        let criteria = SearchCriteria {
            target_sites: vec![],
            ..SearchCriteria::default()
        };
        assert!(criteria.is_noop());
    }

    #[test]
    fn test_site_keys_normalized_and_deduplicated() {
        let criteria = SearchCriteria {
            target_sites: vec![
                "LoopNet.com".to_string(),
                "https://www.commercialmls.com".to_string(),
                "loopnet".to_string(),
                "  ".to_string(),
            ],
            ..SearchCriteria::default()
        };
        assert_eq!(criteria.site_keys(), vec!["loopnet", "commercialmls"]);
    }

    #[test]
    fn test_listed_since() {
        let criteria = SearchCriteria {
            lookback_days: 7,
            ..SearchCriteria::default()
        };
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(criteria.listed_since(today), NaiveDate::from_ymd_opt(2024, 2, 27).unwrap());
    }

    #[test]
    fn test_property_type_parsing() {
        assert_eq!("office".parse::<PropertyType>().unwrap(), PropertyType::Office);
        assert_eq!("Multi-Family".parse::<PropertyType>().unwrap(), PropertyType::MultiFamily);
        assert_eq!("Investment".parse::<PropertyType>().unwrap(), PropertyType::MultiFamily);
        assert!("castle".parse::<PropertyType>().is_err());
    }

    #[test]
    fn test_legacy_investment_deserializes_as_multifamily() {
        let types: Vec<PropertyType> = serde_json::from_str(r#"["Investment", "Multi-Family", "Hotel"]"#).unwrap();
        assert_eq!(types, vec![PropertyType::MultiFamily, PropertyType::MultiFamily, PropertyType::Hotel]);
    }
}
