use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use medsupply_core::{Aggregate, AggregateId, AggregateRoot};
use medsupply_events::Event;
use medsupply_products::ProductId;

/// Stock ledger identifier. A product's ledger shares the product's
/// aggregate id, so the two streams are trivially correlated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(pub AggregateId);

impl LedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    /// The ledger stream for a given product.
    pub fn for_product(product_id: ProductId) -> Self {
        Self(product_id.0)
    }

    pub fn product_id(&self) -> ProductId {
        ProductId(self.0)
    }
}

impl core::fmt::Display for LedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Stock batch identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// One expiry-dated stock lot.
///
/// Invariant: `quantity >= 0`. A batch whose quantity reaches zero stays in
/// the ledger for audit; it is simply no longer available for allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBatch {
    pub id: BatchId,
    pub batch_number: String,
    pub expiry_date: NaiveDate,
    pub quantity: i64,
}

/// Ledger-level failures. Structured so callers can surface the offending
/// batch to the operator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown batch {batch_id}")]
    UnknownBatch { batch_id: BatchId },

    #[error(
        "batch {batch_number} already exists with expiry {existing}, received {received} \
         (one batch = one expiry)"
    )]
    BatchExpiryMismatch {
        batch_number: String,
        existing: NaiveDate,
        received: NaiveDate,
    },

    #[error("batch {batch_id}: requested {requested} exceeds available {available}")]
    InsufficientBatchStock {
        batch_id: BatchId,
        requested: i64,
        available: i64,
    },

    #[error("batch {batch_id} has not expired yet (expiry {expiry_date})")]
    NotExpired {
        batch_id: BatchId,
        expiry_date: NaiveDate,
    },

    #[error("batch {batch_id} has no remaining quantity to write off")]
    NothingToWriteOff { batch_id: BatchId },

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Aggregate root: StockLedger, all batches of one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLedger {
    id: LedgerId,
    batches: Vec<StockBatch>,
    version: u64,
}

impl StockLedger {
    /// Empty ledger for rehydration. Ledgers are created implicitly by the
    /// first stock receipt; an empty stream simply means "no stock yet".
    pub fn empty(id: LedgerId) -> Self {
        Self {
            id,
            batches: Vec::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> LedgerId {
        self.id
    }

    /// Derived in-hand stock: the sum of all batch quantities.
    pub fn on_hand(&self) -> i64 {
        self.batches.iter().map(|b| b.quantity).sum()
    }

    pub fn batches(&self) -> &[StockBatch] {
        &self.batches
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<&StockBatch> {
        self.batches.iter().find(|b| b.id == batch_id)
    }

    pub fn batch_by_number(&self, batch_number: &str) -> Option<&StockBatch> {
        self.batches.iter().find(|b| b.batch_number == batch_number)
    }

    /// Batches with remaining quantity, sorted by expiry date ascending
    /// (FEFO-first presentation; the caller may still allocate from any of
    /// them).
    pub fn available_batches(&self) -> Vec<&StockBatch> {
        let mut available: Vec<&StockBatch> =
            self.batches.iter().filter(|b| b.quantity > 0).collect();
        available.sort_by(|a, b| {
            a.expiry_date
                .cmp(&b.expiry_date)
                .then_with(|| a.batch_number.cmp(&b.batch_number))
        });
        available
    }
}

impl AggregateRoot for StockLedger {
    type Id = LedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ReceiveStock (from an approved purchase item).
///
/// `batch_id` is the id a *new* batch would get; if `batch_number` already
/// exists (with a matching expiry) the existing batch is incremented instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveStock {
    pub ledger_id: LedgerId,
    pub batch_id: BatchId,
    pub batch_number: String,
    pub expiry_date: NaiveDate,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// One allocation line against a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDraw {
    pub batch_id: BatchId,
    pub quantity: i64,
}

/// Command: DrawStock. Decrement batches for a dispatch. All draws are
/// validated together (duplicate batch ids are summed) and either all apply
/// or none do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawStock {
    pub ledger_id: LedgerId,
    pub draws: Vec<BatchDraw>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: WriteOffBatch. Zeroes an expired batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOffBatch {
    pub ledger_id: LedgerId,
    pub batch_id: BatchId,
    /// Reference date for the expiry check (normally "today").
    pub as_of: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    ReceiveStock(ReceiveStock),
    DrawStock(DrawStock),
    WriteOffBatch(WriteOffBatch),
}

/// Event: StockReceived. `batch_id` refers to an existing batch when the
/// receipt incremented one, otherwise it introduces a new batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceived {
    pub ledger_id: LedgerId,
    pub batch_id: BatchId,
    pub batch_number: String,
    pub expiry_date: NaiveDate,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockDrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDrawn {
    pub ledger_id: LedgerId,
    pub batch_id: BatchId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BatchWrittenOff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWrittenOff {
    pub ledger_id: LedgerId,
    pub batch_id: BatchId,
    pub quantity_written_off: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    StockReceived(StockReceived),
    StockDrawn(StockDrawn),
    BatchWrittenOff(BatchWrittenOff),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::StockReceived(_) => "inventory.ledger.stock_received",
            LedgerEvent::StockDrawn(_) => "inventory.ledger.stock_drawn",
            LedgerEvent::BatchWrittenOff(_) => "inventory.ledger.batch_written_off",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::StockReceived(e) => e.occurred_at,
            LedgerEvent::StockDrawn(e) => e.occurred_at,
            LedgerEvent::BatchWrittenOff(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockLedger {
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = LedgerError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::StockReceived(e) => {
                self.id = e.ledger_id;
                if let Some(batch) = self.batches.iter_mut().find(|b| b.id == e.batch_id) {
                    batch.quantity += e.quantity;
                } else {
                    self.batches.push(StockBatch {
                        id: e.batch_id,
                        batch_number: e.batch_number.clone(),
                        expiry_date: e.expiry_date,
                        quantity: e.quantity,
                    });
                }
            }
            LedgerEvent::StockDrawn(e) => {
                let batch = self
                    .batches
                    .iter_mut()
                    .find(|b| b.id == e.batch_id)
                    .unwrap_or_else(|| panic!("stock drawn from unknown batch {}", e.batch_id));
                // A committed draw that overshoots the batch is a logic
                // defect, never a recoverable condition.
                assert!(
                    batch.quantity >= e.quantity,
                    "batch {} would go negative ({} - {})",
                    e.batch_id,
                    batch.quantity,
                    e.quantity
                );
                batch.quantity -= e.quantity;
            }
            LedgerEvent::BatchWrittenOff(e) => {
                let batch = self
                    .batches
                    .iter_mut()
                    .find(|b| b.id == e.batch_id)
                    .unwrap_or_else(|| panic!("write-off of unknown batch {}", e.batch_id));
                batch.quantity = 0;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LedgerCommand::ReceiveStock(cmd) => self.handle_receive(cmd),
            LedgerCommand::DrawStock(cmd) => self.handle_draw(cmd),
            LedgerCommand::WriteOffBatch(cmd) => self.handle_write_off(cmd),
        }
    }
}

impl StockLedger {
    fn handle_receive(&self, cmd: &ReceiveStock) -> Result<Vec<LedgerEvent>, LedgerError> {
        if cmd.quantity < 1 {
            return Err(LedgerError::Validation(
                "received quantity must be at least 1".to_string(),
            ));
        }
        if cmd.batch_number.trim().is_empty() {
            return Err(LedgerError::Validation(
                "batch number cannot be empty".to_string(),
            ));
        }

        // One batch = one expiry: an existing batch number must carry the
        // same expiry date, otherwise the receipt is rejected.
        let batch_id = match self.batch_by_number(&cmd.batch_number) {
            Some(existing) if existing.expiry_date != cmd.expiry_date => {
                return Err(LedgerError::BatchExpiryMismatch {
                    batch_number: cmd.batch_number.clone(),
                    existing: existing.expiry_date,
                    received: cmd.expiry_date,
                });
            }
            Some(existing) => existing.id,
            None => cmd.batch_id,
        };

        Ok(vec![LedgerEvent::StockReceived(StockReceived {
            ledger_id: cmd.ledger_id,
            batch_id,
            batch_number: cmd.batch_number.clone(),
            expiry_date: cmd.expiry_date,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_draw(&self, cmd: &DrawStock) -> Result<Vec<LedgerEvent>, LedgerError> {
        if cmd.draws.is_empty() {
            return Err(LedgerError::Validation(
                "draw must contain at least one line".to_string(),
            ));
        }

        // Validate cumulatively: several lines may hit the same batch.
        let mut requested_per_batch: Vec<(BatchId, i64)> = Vec::new();
        for draw in &cmd.draws {
            if draw.quantity < 1 {
                return Err(LedgerError::Validation(format!(
                    "draw quantity must be at least 1 (batch {})",
                    draw.batch_id
                )));
            }
            match requested_per_batch.iter_mut().find(|(id, _)| *id == draw.batch_id) {
                Some((_, total)) => *total += draw.quantity,
                None => requested_per_batch.push((draw.batch_id, draw.quantity)),
            }
        }

        for (batch_id, requested) in &requested_per_batch {
            let batch = self
                .batch(*batch_id)
                .ok_or(LedgerError::UnknownBatch { batch_id: *batch_id })?;
            if *requested > batch.quantity {
                return Err(LedgerError::InsufficientBatchStock {
                    batch_id: *batch_id,
                    requested: *requested,
                    available: batch.quantity,
                });
            }
        }

        Ok(cmd
            .draws
            .iter()
            .map(|draw| {
                LedgerEvent::StockDrawn(StockDrawn {
                    ledger_id: cmd.ledger_id,
                    batch_id: draw.batch_id,
                    quantity: draw.quantity,
                    occurred_at: cmd.occurred_at,
                })
            })
            .collect())
    }

    fn handle_write_off(&self, cmd: &WriteOffBatch) -> Result<Vec<LedgerEvent>, LedgerError> {
        let batch = self
            .batch(cmd.batch_id)
            .ok_or(LedgerError::UnknownBatch { batch_id: cmd.batch_id })?;

        if batch.expiry_date >= cmd.as_of {
            return Err(LedgerError::NotExpired {
                batch_id: cmd.batch_id,
                expiry_date: batch.expiry_date,
            });
        }
        if batch.quantity == 0 {
            return Err(LedgerError::NothingToWriteOff { batch_id: cmd.batch_id });
        }

        Ok(vec![LedgerEvent::BatchWrittenOff(BatchWrittenOff {
            ledger_id: cmd.ledger_id,
            batch_id: cmd.batch_id,
            quantity_written_off: batch.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }
}
