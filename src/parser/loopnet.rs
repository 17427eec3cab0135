use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::config::PropertyType;
use crate::error::CrawlerError;
use crate::parser::html_parser::{absolute_url, element_text, first_text, parse_price, selector, ListingPageParser, ParsedPage};
use crate::parser::Listing;

pub const LOOPNET_SITE: &str = "loopnet";
pub const LOOPNET_BASE_URL: &str = "https://www.loopnet.com/";

const DETAILS_PREFIX: &str = "More details for ";

/// Parser for LoopNet search result placards
pub struct LoopNetParser {
    base: Url,
    card_selector: Selector,
    fallback_card_selector: Selector,
    street_selector: Selector,
    locality_selector: Selector,
    price_selector: Selector,
    data_point_selector: Selector,
    link_selector: Selector,
    description_selector: Selector,
    details_link_selector: Selector,
}

impl LoopNetParser {
    pub fn new() -> Result<Self, CrawlerError> {
        Ok(Self {
            base: Url::parse(LOOPNET_BASE_URL).map_err(|e| CrawlerError::Parse(e.to_string()))?,
            card_selector: selector("div.placard-content")?,
            fallback_card_selector: selector(".property-card, article.placard")?,
            street_selector: selector("h4 a")?,
            locality_selector: selector("a.subtitle-beta")?,
            price_selector: selector("li[name='Price']")?,
            data_point_selector: selector("ul.data-points-2c li")?,
            link_selector: selector("a[title*='More details']")?,
            description_selector: selector("p.placard-description, .description-text")?,
            details_link_selector: selector("a[title*='More details for']")?,
        })
    }

    fn parse_card(&self, card: ElementRef) -> Result<Option<Listing>, CrawlerError> {
        // promoted tiles and ads carry no details link
        let link = match card.select(&self.link_selector).next() {
            Some(link) => link,
            None => return Ok(None),
        };

        let url = link
            .value()
            .attr("href")
            .and_then(|href| absolute_url(&self.base, href))
            .ok_or_else(|| CrawlerError::Parse("placard details link has no usable href".to_string()))?;

        let street = first_text(card, &self.street_selector);
        let locality = first_text(card, &self.locality_selector);
        let from_title = link.value().attr("title").and_then(parse_details_title);

        let title = street
            .clone()
            .or_else(|| from_title.as_ref().map(|(address, _)| address.clone()))
            .ok_or_else(|| CrawlerError::Parse(format!("placard {} has neither address nor title", url)))?;

        let address = match (&street, &locality) {
            (Some(street), Some(locality)) => format!("{}, {}", street, locality),
            (Some(street), None) => street.clone(),
            (None, _) => title.clone(),
        };

        let data_points: Vec<String> = card.select(&self.data_point_selector).map(element_text).collect();
        let property_type = data_points
            .get(2)
            .and_then(|text| text.parse::<PropertyType>().ok())
            .or_else(|| from_title.and_then(|(_, kind)| kind));
        let size = data_points
            .iter()
            .find(|text| text.contains(" SF") || text.ends_with(" AC"))
            .cloned()
            .unwrap_or_default();

        let listing = Listing::new(LOOPNET_SITE, title, url)
            .with_address(address)
            .with_price(first_text(card, &self.price_selector).as_deref().and_then(parse_price))
            .with_property_type(property_type)
            .with_size(size)
            .with_description(first_text(card, &self.description_selector).unwrap_or_default());

        Ok(Some(listing))
    }

    /// Last resort when the placard markup changed: every details link's
    /// title attribute still names the property.
    fn parse_details_links(&self, document: &Html) -> ParsedPage {
        let mut page = ParsedPage::default();
        let now = Utc::now();

        for link in document.select(&self.details_link_selector) {
            let url = link.value().attr("href").and_then(|href| absolute_url(&self.base, href));
            let details = link.value().attr("title").and_then(parse_details_title);

            match (url, details) {
                (Some(url), Some((address, kind))) => {
                    if page.listings.iter().any(|l| l.url == url) {
                        continue;
                    }
                    page.listings.push(
                        Listing::new(LOOPNET_SITE, address.clone(), url)
                            .with_address(address)
                            .with_property_type(kind)
                            .discovered_at(now),
                    );
                }
                (None, _) => page.skipped.push("details link has no usable href".to_string()),
                (_, None) => page.skipped.push("details link title could not be parsed".to_string()),
            }
        }
        page
    }
}

impl ListingPageParser for LoopNetParser {
    fn site(&self) -> &'static str {
        LOOPNET_SITE
    }

    fn parse_results(&self, html: &str) -> ParsedPage {
        let document = Html::parse_document(html);

        let mut cards: Vec<ElementRef> = document.select(&self.card_selector).collect();
        if cards.is_empty() {
            cards = document.select(&self.fallback_card_selector).collect();
        }
        if cards.is_empty() {
            debug!("No LoopNet placards found, falling back to details links");
            return self.parse_details_links(&document);
        }

        let mut page = ParsedPage::default();
        for card in cards {
            match self.parse_card(card) {
                Ok(Some(listing)) if listing.is_valid() => page.listings.push(listing),
                Ok(Some(listing)) => page.skipped.push(format!("invalid listing at {}", listing.url)),
                Ok(None) => debug!("Skipping LoopNet placard without details link"),
                Err(e) => {
                    warn!("Failed to parse LoopNet placard: {}", e);
                    page.skipped.push(e.to_string());
                }
            }
        }

        debug!("Parsed {} LoopNet listings ({} skipped)", page.listings.len(), page.skipped.len());
        page
    }
}

/// `More details for 1201 3rd Ave, Seattle, WA - Office for Sale`
/// yields the address and, when recognisable, the property type.
fn parse_details_title(title: &str) -> Option<(String, Option<PropertyType>)> {
    let rest = title.trim().strip_prefix(DETAILS_PREFIX)?;
    let (address, tail) = match rest.rsplit_once(" - ") {
        Some((address, tail)) => (address.trim(), Some(tail)),
        None => (rest.trim(), None),
    };
    if address.is_empty() {
        return None;
    }
    let kind = tail
        .and_then(|tail| tail.split(" for ").next())
        .and_then(|kind| kind.parse::<PropertyType>().ok());
    Some((address.to_string(), kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r##"
        <html><body>
          <div class="placard-content">
            <h4><a href="/Listing/1201-3rd-Ave-Seattle-WA/111/">1201 3rd Ave</a></h4>
            <a class="subtitle-beta">Seattle, WA 98101</a>
            <ul class="data-points-2c">
              <li name="Price">$4,250,000</li>
              <li>18,400 SF</li>
              <li>Office</li>
            </ul>
            <p class="placard-description">Corner building with retail frontage.</p>
            <a title="More details for 1201 3rd Ave - Office for Sale" href="/Listing/1201-3rd-Ave-Seattle-WA/111/">Details</a>
          </div>
          <div class="placard-content">
            <h4><a href="#">Sponsored</a></h4>
          </div>
          <div class="placard-content">
            <a class="subtitle-beta">Tacoma, WA</a>
            <a title="More details" href="/Listing/222/">Details</a>
          </div>
          <div class="placard-content">
            <h4><a>500 Pine St</a></h4>
            <ul class="data-points-2c">
              <li name="Price">Price Not Disclosed</li>
              <li>2.5 AC</li>
              <li>Retail</li>
            </ul>
            <a title="More details for 500 Pine St - Retail for Sale" href="https://www.loopnet.com/Listing/333/">Details</a>
          </div>
        </body></html>
    "##;

    #[test]
    fn test_parse_placards() {
        let parser = LoopNetParser::new().unwrap();
        let page = parser.parse_results(RESULTS_PAGE);

        assert_eq!(page.listings.len(), 2);
        // card without address/title is malformed, sponsored card is ignored
        assert_eq!(page.skipped.len(), 1);

        let first = &page.listings[0];
        assert_eq!(first.source_site, "loopnet");
        assert_eq!(first.title, "1201 3rd Ave");
        assert_eq!(first.address.as_deref(), Some("1201 3rd Ave, Seattle, WA 98101"));
        assert_eq!(first.price, Some(4_250_000));
        assert_eq!(first.property_type, Some(PropertyType::Office));
        assert_eq!(first.size.as_deref(), Some("18,400 SF"));
        assert_eq!(first.url, "https://www.loopnet.com/Listing/1201-3rd-Ave-Seattle-WA/111/");
        assert_eq!(first.description.as_deref(), Some("Corner building with retail frontage."));

        let second = &page.listings[1];
        assert_eq!(second.title, "500 Pine St");
        assert_eq!(second.price, None);
        assert_eq!(second.size.as_deref(), Some("2.5 AC"));
        assert_eq!(second.property_type, Some(PropertyType::Retail));
    }

    #[test]
    fn test_fallback_to_details_links() {
        let html = r#"
            <html><body>
              <a title="More details for 77 Harbor Way, Everett, WA - Industrial for Sale" href="/Listing/77/">x</a>
              <a title="More details for 77 Harbor Way, Everett, WA - Industrial for Sale" href="/Listing/77/">dup</a>
              <a title="More details for 9 Elm St" href="/Listing/9/">y</a>
            </body></html>
        "#;
        let parser = LoopNetParser::new().unwrap();
        let page = parser.parse_results(html);

        assert_eq!(page.listings.len(), 2);
        assert_eq!(page.listings[0].title, "77 Harbor Way, Everett, WA");
        assert_eq!(page.listings[0].property_type, Some(PropertyType::Industrial));
        assert_eq!(page.listings[0].url, "https://www.loopnet.com/Listing/77/");
        assert_eq!(page.listings[1].title, "9 Elm St");
        assert_eq!(page.listings[1].property_type, None);
    }

    #[test]
    fn test_empty_results_page() {
        let parser = LoopNetParser::new().unwrap();
        let page = parser.parse_results("<html><body><p>No results</p></body></html>");
        assert!(page.is_empty());
    }

    #[test]
    fn test_parse_details_title() {
        assert_eq!(
            parse_details_title("More details for 1 Main St - Multifamily for Sale"),
            Some(("1 Main St".to_string(), Some(PropertyType::MultiFamily)))
        );
        assert_eq!(parse_details_title("Something else"), None);
        assert_eq!(parse_details_title("More details for  - Office for Sale"), None);
    }
}
