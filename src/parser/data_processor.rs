use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::parser::{Listing, ListingKey};

/// Collapses listings that share a (site, url) key.
///
/// Listings must be fed in extraction order; a later duplicate is merged into
/// the first occurrence field by field, so the output keeps first-seen order.
#[derive(Debug, Default)]
pub struct ListingMerger {
    index: HashMap<ListingKey, usize>,
    listings: Vec<Listing>,
    duplicates: usize,
}

impl ListingMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, listing: Listing) {
        let key = listing.key();
        match self.index.get(&key) {
            Some(&slot) => {
                self.listings[slot].absorb(listing);
                self.duplicates += 1;
            }
            None => {
                self.index.insert(key, self.listings.len());
                self.listings.push(listing);
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = Listing>>(&mut self, listings: I) {
        for listing in listings {
            self.push(listing);
        }
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn finish(self) -> Vec<Listing> {
        debug!(
            "Merged listings: {} unique, {} duplicates collapsed",
            self.listings.len(),
            self.duplicates
        );
        self.listings
    }
}

/// Listings in `current` whose key was not present in `previous`.
pub fn new_since<'a>(current: &'a [Listing], previous: &[Listing]) -> Vec<&'a Listing> {
    let known: HashSet<ListingKey> = previous.iter().map(Listing::key).collect();
    current.iter().filter(|l| !known.contains(&l.key())).collect()
}
