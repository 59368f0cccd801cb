//! Batch ledger: per-product, expiry-dated stock lots.
//!
//! One ledger aggregate per product (the ledger stream shares the product's
//! aggregate id). A product's in-hand stock is the sum of its batch
//! quantities; there is no separately stored stock counter anywhere.

pub mod expiry;
pub mod ledger;

pub use expiry::{ExpiryStatus, classify_expiry};
pub use ledger::{
    BatchDraw, BatchId, BatchWrittenOff, DrawStock, LedgerCommand, LedgerError, LedgerEvent,
    LedgerId, ReceiveStock, StockBatch, StockDrawn, StockLedger, StockReceived, WriteOffBatch,
};
