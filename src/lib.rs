//! # Meridian
//!
//! Swap settlement backend: Soroswap quotes → signed envelope → Stellar
//! submission → per-user position ledger, with an optional on-chain price
//! oracle update after every confirmed swap.
//!
//! Shared by the `meridian` HTTP service and the `price-feeder` loop.

pub mod auth;
pub mod config;
#[cfg(feature = "postgres")]
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod feeder;
pub mod models;
pub mod routes;
pub mod state;
pub mod units;
