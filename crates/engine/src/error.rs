//! Engine-level error type.
//!
//! One enum over the structured domain errors plus infrastructure failures,
//! so callers match on a single type. Domain variants are terminal
//! rejections; only `EventStoreError::Concurrency` is ever retried, and
//! `ConflictRetriesExhausted` reports when that budget runs out.

use thiserror::Error;

use medsupply_core::DomainError;
use medsupply_inventory::LedgerError;
use medsupply_invoicing::{InvoiceError, TotalsError};
use medsupply_orders::OrderError;
use medsupply_purchasing::PurchaseError;

use crate::event_store::EventStoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Product(#[from] DomainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Purchase(#[from] PurchaseError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Invoice(#[from] InvoiceError),

    #[error(transparent)]
    Totals(#[from] TotalsError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("failed to deserialize stored event payload: {0}")]
    Deserialize(String),

    #[error("event publication failed: {0}")]
    Publish(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("gave up after {attempts} optimistic concurrency retries")]
    ConflictRetriesExhausted { attempts: u32 },
}

impl EngineError {
    /// True when re-reading and re-validating might let the operation
    /// succeed. Everything else is a terminal rejection.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_concurrency())
    }
}
