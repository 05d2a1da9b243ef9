//! GreenBlocks: carbon-credit claim lifecycle and marketplace settlement.
//!
//! Projects are verified by regulators, developers claim credits against
//! MRV evidence, issued credits are minted on an external token ledger and
//! sold through listings that settle into buyer ownership records.

pub mod account;
pub mod adapters;
pub mod auth;
pub mod claim;
pub mod claim_engine;
pub mod config;
pub mod error;
pub mod listing;
pub mod marketplace;
pub mod mrv;
pub mod ownership;
pub mod ports;
pub mod project;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

pub use error::{ErrorKind, MarketError};
pub use service::GreenBlocksService;
