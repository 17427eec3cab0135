pub mod commercialmls;
pub mod data_processor;
pub mod html_parser;
pub mod listing;
pub mod loopnet;

pub use commercialmls::CommercialMlsParser;
pub use data_processor::{new_since, ListingMerger};
pub use html_parser::{parse_price, ListingPageParser, ParsedPage};
pub use listing::*;
pub use loopnet::LoopNetParser;
