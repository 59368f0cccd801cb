use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use medsupply_core::{Aggregate, AggregateId, AggregateRoot};
use medsupply_events::Event;
use medsupply_products::ProductId;

/// Purchase identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseId(pub AggregateId);

impl PurchaseId {
    pub fn new() -> Self {
        Self(AggregateId::new())
    }
}

impl Default for PurchaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PurchaseId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Approved,
}

/// One purchase line. `batch_number` may be left empty by the supplier; a
/// number is synthesized at approval so every receipt lands in a named batch.
/// The expiry date is mandatory because a batch cannot exist without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseItem {
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: i64,
    pub batch_number: Option<String>,
    pub expiry_date: NaiveDate,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PurchaseError {
    #[error("purchase {purchase_id} already exists")]
    AlreadyExists { purchase_id: PurchaseId },

    #[error("purchase {purchase_id} does not exist")]
    NotFound { purchase_id: PurchaseId },

    #[error("purchase {purchase_id} is already approved")]
    AlreadyApproved { purchase_id: PurchaseId },

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Aggregate root: a supplier purchase record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purchase {
    id: PurchaseId,
    supplier_name: String,
    status: PurchaseStatus,
    is_paid: bool,
    items: Vec<PurchaseItem>,
    version: u64,
    created: bool,
}

impl Purchase {
    pub fn empty(id: PurchaseId) -> Self {
        Self {
            id,
            supplier_name: String::new(),
            status: PurchaseStatus::Pending,
            is_paid: false,
            items: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseId {
        self.id
    }

    pub fn supplier_name(&self) -> &str {
        &self.supplier_name
    }

    pub fn status(&self) -> PurchaseStatus {
        self.status
    }

    pub fn is_paid(&self) -> bool {
        self.is_paid
    }

    pub fn items(&self) -> &[PurchaseItem] {
        &self.items
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    /// Batch number a line will receive at approval: the supplied one, or a
    /// synthesized `P<8 uuid hex>-<line>` when the supplier gave none.
    pub fn effective_batch_number(&self, line_index: usize) -> String {
        match &self.items[line_index].batch_number {
            Some(number) if !number.trim().is_empty() => number.trim().to_string(),
            _ => {
                let hex = self.id.0.as_uuid().simple().to_string();
                format!("P{}-{}", &hex[..8], line_index + 1)
            }
        }
    }
}

impl AggregateRoot for Purchase {
    type Id = PurchaseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchase {
    pub purchase_id: PurchaseId,
    pub supplier_name: String,
    pub items: Vec<PurchaseItem>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovePurchase {
    pub purchase_id: PurchaseId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPurchasePaid {
    pub purchase_id: PurchaseId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseCommand {
    Create(CreatePurchase),
    Approve(ApprovePurchase),
    MarkPaid(MarkPurchasePaid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseCreated {
    pub purchase_id: PurchaseId,
    pub supplier_name: String,
    pub items: Vec<PurchaseItem>,
    pub occurred_at: DateTime<Utc>,
}

/// What an approval actually put into stock: one line per purchase item with
/// the batch number resolved (supplied or synthesized). The ledger receipts
/// committed alongside this event carry exactly these lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub product_id: ProductId,
    pub batch_number: String,
    pub expiry_date: NaiveDate,
    pub quantity: i64,
    pub unit_price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseApproved {
    pub purchase_id: PurchaseId,
    pub lines: Vec<ReceiptLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchasePaid {
    pub purchase_id: PurchaseId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseEvent {
    Created(PurchaseCreated),
    Approved(PurchaseApproved),
    Paid(PurchasePaid),
}

impl Event for PurchaseEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseEvent::Created(_) => "purchasing.purchase.created",
            PurchaseEvent::Approved(_) => "purchasing.purchase.approved",
            PurchaseEvent::Paid(_) => "purchasing.purchase.paid",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseEvent::Created(e) => e.occurred_at,
            PurchaseEvent::Approved(e) => e.occurred_at,
            PurchaseEvent::Paid(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Purchase {
    type Command = PurchaseCommand;
    type Event = PurchaseEvent;
    type Error = PurchaseError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseEvent::Created(e) => {
                self.id = e.purchase_id;
                self.supplier_name = e.supplier_name.clone();
                self.items = e.items.clone();
                self.status = PurchaseStatus::Pending;
                self.created = true;
            }
            PurchaseEvent::Approved(_) => {
                // Approval is one-time; committing it twice is a logic defect.
                assert!(
                    self.status == PurchaseStatus::Pending,
                    "purchase {} approved twice",
                    self.id
                );
                self.status = PurchaseStatus::Approved;
            }
            PurchaseEvent::Paid(_) => {
                self.is_paid = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseCommand::Create(cmd) => self.handle_create(cmd),
            PurchaseCommand::Approve(cmd) => self.handle_approve(cmd),
            PurchaseCommand::MarkPaid(cmd) => self.handle_mark_paid(cmd),
        }
    }
}

impl Purchase {
    fn handle_create(&self, cmd: &CreatePurchase) -> Result<Vec<PurchaseEvent>, PurchaseError> {
        if self.created {
            return Err(PurchaseError::AlreadyExists { purchase_id: self.id });
        }
        if cmd.supplier_name.trim().is_empty() {
            return Err(PurchaseError::Validation(
                "supplier name cannot be empty".to_string(),
            ));
        }
        if cmd.items.is_empty() {
            return Err(PurchaseError::Validation(
                "purchase must contain at least one item".to_string(),
            ));
        }
        for (index, item) in cmd.items.iter().enumerate() {
            if item.quantity < 1 {
                return Err(PurchaseError::Validation(format!(
                    "item {}: quantity must be at least 1",
                    index + 1
                )));
            }
            if item.unit_price < 0 {
                return Err(PurchaseError::Validation(format!(
                    "item {}: unit price cannot be negative",
                    index + 1
                )));
            }
        }

        Ok(vec![PurchaseEvent::Created(PurchaseCreated {
            purchase_id: cmd.purchase_id,
            supplier_name: cmd.supplier_name.trim().to_string(),
            items: cmd.items.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApprovePurchase) -> Result<Vec<PurchaseEvent>, PurchaseError> {
        if !self.created {
            return Err(PurchaseError::NotFound { purchase_id: cmd.purchase_id });
        }
        if self.status == PurchaseStatus::Approved {
            return Err(PurchaseError::AlreadyApproved { purchase_id: self.id });
        }

        let lines = self
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| ReceiptLine {
                product_id: item.product_id,
                batch_number: self.effective_batch_number(index),
                expiry_date: item.expiry_date,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();

        Ok(vec![PurchaseEvent::Approved(PurchaseApproved {
            purchase_id: self.id,
            lines,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_paid(
        &self,
        cmd: &MarkPurchasePaid,
    ) -> Result<Vec<PurchaseEvent>, PurchaseError> {
        if !self.created {
            return Err(PurchaseError::NotFound { purchase_id: cmd.purchase_id });
        }
        if self.is_paid {
            // Marking paid twice is a no-op, not an error.
            return Ok(Vec::new());
        }

        Ok(vec![PurchaseEvent::Paid(PurchasePaid {
            purchase_id: self.id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(batch_number: Option<&str>) -> PurchaseItem {
        PurchaseItem {
            product_id: ProductId(AggregateId::new()),
            quantity: 10,
            unit_price: 2_000,
            batch_number: batch_number.map(str::to_string),
            expiry_date: "2026-01-01".parse().unwrap(),
        }
    }

    fn created_purchase(items: Vec<PurchaseItem>) -> Purchase {
        let id = PurchaseId::new();
        let mut purchase = Purchase::empty(id);
        let events = purchase
            .handle(&PurchaseCommand::Create(CreatePurchase {
                purchase_id: id,
                supplier_name: "Medico Supplies".to_string(),
                items,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            purchase.apply(e);
        }
        purchase
    }

    #[test]
    fn approval_resolves_batch_numbers() {
        let purchase = created_purchase(vec![item(Some("BN-77")), item(None)]);

        let events = purchase
            .handle(&PurchaseCommand::Approve(ApprovePurchase {
                purchase_id: purchase.id_typed(),
                occurred_at: Utc::now(),
            }))
            .unwrap();

        let PurchaseEvent::Approved(approved) = &events[0] else {
            panic!("expected approval event");
        };
        assert_eq!(approved.lines[0].batch_number, "BN-77");
        // Synthesized from the purchase id, stable across replays.
        let hex = purchase.id_typed().0.as_uuid().simple().to_string();
        assert_eq!(approved.lines[1].batch_number, format!("P{}-2", &hex[..8]));
    }

    #[test]
    fn second_approval_is_rejected() {
        let mut purchase = created_purchase(vec![item(None)]);
        let events = purchase
            .handle(&PurchaseCommand::Approve(ApprovePurchase {
                purchase_id: purchase.id_typed(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            purchase.apply(e);
        }
        assert_eq!(purchase.status(), PurchaseStatus::Approved);

        let err = purchase
            .handle(&PurchaseCommand::Approve(ApprovePurchase {
                purchase_id: purchase.id_typed(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, PurchaseError::AlreadyApproved { .. }));
    }

    #[test]
    fn create_rejects_bad_lines() {
        let id = PurchaseId::new();
        let purchase = Purchase::empty(id);

        let mut bad = item(None);
        bad.quantity = 0;
        let err = purchase
            .handle(&PurchaseCommand::Create(CreatePurchase {
                purchase_id: id,
                supplier_name: "Medico Supplies".to_string(),
                items: vec![item(None), bad],
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, PurchaseError::Validation(_)));
    }

    #[test]
    fn mark_paid_is_idempotent() {
        let mut purchase = created_purchase(vec![item(None)]);

        let events = purchase
            .handle(&PurchaseCommand::MarkPaid(MarkPurchasePaid {
                purchase_id: purchase.id_typed(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assert_eq!(events.len(), 1);
        for e in &events {
            purchase.apply(e);
        }
        assert!(purchase.is_paid());

        let repeat = purchase
            .handle(&PurchaseCommand::MarkPaid(MarkPurchasePaid {
                purchase_id: purchase.id_typed(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assert!(repeat.is_empty());
    }
}
