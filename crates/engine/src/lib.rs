//! Fulfillment engine: event store, command execution and reporting reads.
//!
//! This crate composes the domain aggregates behind one service. Every
//! mutating operation re-reads the streams it touches, re-validates against
//! the rehydrated state and appends with an exact expected version per
//! stream; a concurrent committer forces a bounded re-read/re-validate
//! retry. The append is all-or-nothing across every stream in the batch.

pub mod config;
pub mod error;
pub mod event_store;
pub mod executor;
pub mod reports;
pub mod service;
pub mod telemetry;


pub use config::EngineConfig;
pub use error::EngineError;
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, StoredEvent, StreamAppend, UncommittedEvent,
};
pub use reports::{
    BatchExpiryRow, InvoiceSummary, OrderFulfillmentRow, OrderSummary, ProductFulfillmentRow,
    StockRequirementRow, StoreOutstandingRow,
};
pub use service::FulfillmentEngine;
