//! Swap pipeline: external collaborators, the position ledger and the
//! orchestrator that ties them together.

pub mod builder;
pub mod ledger;
pub mod orchestrator;
pub mod price_recorder;
pub mod quote_client;
pub mod soroswap;
pub mod submitter;

pub use builder::TransactionBuilder;
pub use ledger::PositionLedger;
pub use orchestrator::{CancelHandle, CancelToken, ExecutionReport, IntentKind, SwapOrchestrator, SwapStage, TradeIntent};
pub use price_recorder::{PriceRecorder, StellarCliRecorder};
pub use quote_client::QuoteClient;
pub use soroswap::SoroswapClient;
pub use submitter::Submitter;
