pub mod aggregate;
pub mod builder;
pub mod cli;
pub mod config;
pub mod error;
pub mod forest;
pub mod hamming;
pub mod imdb;
pub mod memory;
pub mod metrics;
pub mod refine;
pub mod scorer;
pub mod search_config;
pub mod searcher;
pub mod store;
pub mod utils;

pub use config::Opts;
pub use error::{Error, Result};
pub use imdb::IMDB;
pub use scorer::MatchResult;
pub use search_config::{ConfigUpdate, SearchConfig, SharedConfig};
pub use searcher::{SearchContext, SearchReport};
