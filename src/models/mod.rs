//! Domain models shared across the Meridian swap pipeline.

pub mod position;
pub mod quote;
pub mod transaction;

pub use position::{AuditEntry, AuditKind, ClosedPosition, Position, PositionStatus, Side};
pub use quote::{PriceQuote, Quote, QuoteRequest, RouteLeg};
pub use transaction::{SignedTransaction, SubmissionReceipt, SubmissionResult, SubmissionStatus};
