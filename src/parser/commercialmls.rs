use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::config::PropertyType;
use crate::error::CrawlerError;
use crate::parser::html_parser::{absolute_url, first_text, parse_price, selector, ListingPageParser, ParsedPage};
use crate::parser::Listing;

pub const COMMERCIALMLS_SITE: &str = "commercialmls";
pub const COMMERCIALMLS_BASE_URL: &str = "https://www.commercialmls.com/";

/// Parser for the CommercialMLS results grid
pub struct CommercialMlsParser {
    base: Url,
    card_selector: Selector,
    link_selector: Selector,
    badge_selector: Selector,
    name_selector: Selector,
    price_selector: Selector,
    size_selector: Selector,
    summary_selector: Selector,
}

impl CommercialMlsParser {
    pub fn new() -> Result<Self, CrawlerError> {
        Ok(Self {
            base: Url::parse(COMMERCIALMLS_BASE_URL).map_err(|e| CrawlerError::Parse(e.to_string()))?,
            card_selector: selector("div.grid-column.grid-card")?,
            link_selector: selector("div.rounded.pointer.card a.link, a.link")?,
            badge_selector: selector("div.badge")?,
            name_selector: selector("div.bottom0.left0.text--white p.bold, p.bold")?,
            price_selector: selector("div.relative.p1 p.mb0.ellipsis span, p.price")?,
            size_selector: selector("span.sqft, p.size")?,
            summary_selector: selector("p.summary, div.description")?,
        })
    }

    fn parse_card(&self, card: ElementRef) -> Result<Listing, CrawlerError> {
        let href = card
            .select(&self.link_selector)
            .next()
            .and_then(|link| link.value().attr("href"))
            .ok_or_else(|| CrawlerError::Parse("grid card has no link".to_string()))?;

        let url = self
            .listing_url(href)
            .ok_or_else(|| CrawlerError::Parse(format!("grid card link '{}' is not a listing url", href)))?;

        let name = first_text(card, &self.name_selector)
            .ok_or_else(|| CrawlerError::Parse(format!("grid card {} has no property name", url)))?;

        let property_type = first_text(card, &self.badge_selector).and_then(|badge| badge.parse::<PropertyType>().ok());

        Ok(Listing::new(COMMERCIALMLS_SITE, name.clone(), url)
            .with_address(name)
            .with_price(first_text(card, &self.price_selector).as_deref().and_then(parse_price))
            .with_property_type(property_type)
            .with_size(first_text(card, &self.size_selector).unwrap_or_default())
            .with_description(first_text(card, &self.summary_selector).unwrap_or_default()))
    }

    /// The grid links with in-app fragments (`#/property/12345`); those map
    /// onto the public property page.
    fn listing_url(&self, href: &str) -> Option<String> {
        let href = href.trim();
        if href.starts_with('#') {
            let id = href.trim_end_matches('/').rsplit('/').next()?.trim_start_matches('#');
            if id.is_empty() {
                return None;
            }
            return Some(format!("{}property/{}", COMMERCIALMLS_BASE_URL, id));
        }
        absolute_url(&self.base, href)
    }
}

impl ListingPageParser for CommercialMlsParser {
    fn site(&self) -> &'static str {
        COMMERCIALMLS_SITE
    }

    fn parse_results(&self, html: &str) -> ParsedPage {
        let document = Html::parse_document(html);
        let mut page = ParsedPage::default();

        for card in document.select(&self.card_selector) {
            match self.parse_card(card) {
                Ok(listing) if listing.is_valid() => page.listings.push(listing),
                Ok(listing) => page.skipped.push(format!("invalid listing at {}", listing.url)),
                Err(e) => {
                    warn!("Failed to parse CommercialMLS card: {}", e);
                    page.skipped.push(e.to_string());
                }
            }
        }

        debug!(
            "Parsed {} CommercialMLS listings ({} skipped)",
            page.listings.len(),
            page.skipped.len()
        );
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRID: &str = r##"
        <html><body>
          <div class="grid-column grid-card">
            <div class="rounded pointer card">
              <a class="link" href="#/property/48213">
                <div class="badge">Industrial</div>
                <div class="bottom0 left0 text--white"><p class="bold">Kent Valley Distribution Center</p></div>
                <div class="relative p1"><p class="mb0 ellipsis"><span>$12,900,000</span></p></div>
                <span class="sqft">96,000 SF</span>
              </a>
            </div>
          </div>
          <div class="grid-column grid-card">
            <div class="rounded pointer card">
              <a class="link" href="/property/51002">
                <div class="badge">Multifamily</div>
                <div class="bottom0 left0 text--white"><p class="bold">Ballard Flats</p></div>
                <div class="relative p1"><p class="mb0 ellipsis"><span>Call for price</span></p></div>
              </a>
            </div>
          </div>
          <div class="grid-column grid-card">
            <div class="rounded pointer card">
              <div class="badge">Office</div>
            </div>
          </div>
        </body></html>
    "##;

    #[test]
    fn test_parse_grid_cards() {
        let parser = CommercialMlsParser::new().unwrap();
        let page = parser.parse_results(GRID);

        assert_eq!(page.listings.len(), 2);
        assert_eq!(page.skipped.len(), 1);

        let first = &page.listings[0];
        assert_eq!(first.source_site, "commercialmls");
        assert_eq!(first.title, "Kent Valley Distribution Center");
        assert_eq!(first.url, "https://www.commercialmls.com/property/48213");
        assert_eq!(first.price, Some(12_900_000));
        assert_eq!(first.property_type, Some(PropertyType::Industrial));
        assert_eq!(first.size.as_deref(), Some("96,000 SF"));

        let second = &page.listings[1];
        assert_eq!(second.url, "https://www.commercialmls.com/property/51002");
        assert_eq!(second.price, None);
        assert_eq!(second.property_type, Some(PropertyType::MultiFamily));
    }

    #[test]
    fn test_fragment_links_map_to_property_pages() {
        let parser = CommercialMlsParser::new().unwrap();
        assert_eq!(
            parser.listing_url("#/search/results/property/777/").as_deref(),
            Some("https://www.commercialmls.com/property/777")
        );
        assert_eq!(parser.listing_url("#").as_deref(), None);
    }
}
