use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use medsupply_core::{Aggregate, AggregateId, AggregateRoot, PharmacyId};
use medsupply_events::Event;
use medsupply_inventory::BatchId;
use medsupply_products::ProductId;

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new() -> Self {
        Self(AggregateId::new())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

macro_rules! impl_line_id {
    ($t:ident) => {
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t(pub Uuid);

        impl $t {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

impl_line_id!(OrderItemId);
impl_line_id!(DispatchId);
impl_line_id!(AllocationId);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Approved,
    Processing,
    Shipped,
    Delivered,
    Rejected,
}

impl OrderStatus {
    fn can_transition_to(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Processing)
                | (Processing, Shipped)
                | (Shipped, Delivered)
        )
    }

    /// Statuses from which stock may be dispatched.
    fn dispatchable(self) -> bool {
        !matches!(self, OrderStatus::Pending | OrderStatus::Rejected)
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Approved => "approved",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Settlement state of an order, derived from the payment ledger against the
/// dispatched value. Never stored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

/// One order line. `dispatched_quantity` and `remaining_quantity` are derived
/// from the order's allocations, not stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: i64,
    /// Flat discount on the full ordered line (not re-prorated on partial
    /// dispatch).
    pub discount_amount: i64,
    pub is_void: bool,
}

impl OrderItem {
    /// Line total for the ordered (not dispatched) quantity.
    pub fn line_total(&self) -> i64 {
        self.quantity * self.unit_price - self.discount_amount
    }
}

/// One batch allocation within a dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub order_item_id: OrderItemId,
    pub batch_id: BatchId,
    pub quantity: i64,
}

/// A confirmed dispatch: a timestamped group of allocations committed in one
/// confirm action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: DispatchId,
    pub dispatched_at: DateTime<Utc>,
    pub allocations: Vec<Allocation>,
}

/// One entry in the order's append-only payment ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub amount: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error("order {order_id} already exists")]
    AlreadyExists { order_id: OrderId },

    #[error("order {order_id} does not exist")]
    NotFound { order_id: OrderId },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("{0} is already void")]
    AlreadyVoid(String),

    #[error("order {order_id} is void")]
    OrderVoid { order_id: OrderId },

    #[error("order is not dispatchable (status {status}, void: {is_void})")]
    OrderNotDispatchable { status: OrderStatus, is_void: bool },

    #[error("line {line}: item {order_item_id} is void")]
    ItemVoided { line: usize, order_item_id: OrderItemId },

    #[error("line {line}: item {order_item_id} does not belong to this order")]
    UnknownItem { line: usize, order_item_id: OrderItemId },

    #[error(
        "line {line}: item {order_item_id} requested {requested} exceeds remaining {remaining}"
    )]
    InsufficientRemaining {
        line: usize,
        order_item_id: OrderItemId,
        requested: i64,
        remaining: i64,
    },

    #[error("payment amount {amount} must be positive")]
    InvalidAmount { amount: i64 },

    #[error("payment amount {amount} exceeds outstanding {outstanding}")]
    ExceedsOutstanding { amount: i64, outstanding: i64 },

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Aggregate root: an order and its full fulfillment history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    order_number: String,
    pharmacy_id: PharmacyId,
    status: OrderStatus,
    is_void: bool,
    salesman_name: String,
    delivery_type: String,
    terms: String,
    items: Vec<OrderItem>,
    dispatches: Vec<DispatchRecord>,
    payments: Vec<PaymentRecord>,
    version: u64,
    created: bool,
}

impl Order {
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            order_number: String::new(),
            pharmacy_id: PharmacyId::from_uuid(Uuid::nil()),
            status: OrderStatus::Pending,
            is_void: false,
            salesman_name: String::new(),
            delivery_type: String::new(),
            terms: String::new(),
            items: Vec::new(),
            dispatches: Vec::new(),
            payments: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn pharmacy_id(&self) -> PharmacyId {
        self.pharmacy_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn is_void(&self) -> bool {
        self.is_void
    }

    pub fn salesman_name(&self) -> &str {
        &self.salesman_name
    }

    pub fn delivery_type(&self) -> &str {
        &self.delivery_type
    }

    pub fn terms(&self) -> &str {
        &self.terms
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn item(&self, item_id: OrderItemId) -> Option<&OrderItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn dispatches(&self) -> &[DispatchRecord] {
        &self.dispatches
    }

    pub fn dispatch(&self, dispatch_id: DispatchId) -> Option<&DispatchRecord> {
        self.dispatches.iter().find(|d| d.id == dispatch_id)
    }

    pub fn payments(&self) -> &[PaymentRecord] {
        &self.payments
    }

    /// Total units of an item committed to dispatches so far.
    pub fn dispatched_quantity(&self, item_id: OrderItemId) -> i64 {
        self.dispatches
            .iter()
            .flat_map(|d| &d.allocations)
            .filter(|a| a.order_item_id == item_id)
            .map(|a| a.quantity)
            .sum()
    }

    /// Units of an item still to dispatch. Voided items have nothing
    /// remaining.
    pub fn remaining_quantity(&self, item_id: OrderItemId) -> i64 {
        match self.item(item_id) {
            Some(item) if !item.is_void && !self.is_void => {
                item.quantity - self.dispatched_quantity(item_id)
            }
            _ => 0,
        }
    }

    /// Order value over non-void lines, discounts applied.
    pub fn total_amount(&self) -> i64 {
        if self.is_void {
            return 0;
        }
        self.items
            .iter()
            .filter(|i| !i.is_void)
            .map(OrderItem::line_total)
            .sum()
    }

    /// Value of everything dispatched so far: dispatched quantity times unit
    /// price over non-void lines, gross of discount.
    pub fn dispatched_value(&self) -> i64 {
        self.items
            .iter()
            .filter(|i| !i.is_void)
            .map(|i| self.dispatched_quantity(i.id) * i.unit_price)
            .sum()
    }

    pub fn paid_amount(&self) -> i64 {
        self.payments.iter().map(|p| p.amount).sum()
    }

    pub fn outstanding_amount(&self) -> i64 {
        (self.dispatched_value() - self.paid_amount()).max(0)
    }

    pub fn payment_status(&self) -> PaymentStatus {
        let dispatched = self.dispatched_value();
        let paid = self.paid_amount();
        if dispatched > 0 && paid >= dispatched {
            PaymentStatus::Paid
        } else if paid > 0 && paid < dispatched {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Unpaid
        }
    }

    /// Line items may only change while nothing has been dispatched.
    pub fn is_editable(&self) -> bool {
        self.dispatches.is_empty()
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Line item payload for order creation and item replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub order_item_id: OrderItemId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: i64,
    pub discount_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub order_number: String,
    pub pharmacy_id: PharmacyId,
    pub items: Vec<NewOrderItem>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOrder {
    pub order_id: OrderId,
    pub to: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidItem {
    pub order_id: OrderId,
    pub order_item_id: OrderItemId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceItems {
    pub order_id: OrderId,
    pub items: Vec<NewOrderItem>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBilling {
    pub order_id: OrderId,
    pub salesman_name: String,
    pub delivery_type: String,
    pub terms: String,
    pub occurred_at: DateTime<Utc>,
}

/// One allocation request line within a dispatch confirmation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLine {
    pub order_item_id: OrderItemId,
    pub batch_id: BatchId,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDispatch {
    pub order_id: OrderId,
    pub dispatch_id: DispatchId,
    pub lines: Vec<DispatchLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub order_id: OrderId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    Create(CreateOrder),
    Transition(TransitionOrder),
    VoidOrder(VoidOrder),
    VoidItem(VoidItem),
    ReplaceItems(ReplaceItems),
    UpdateBilling(UpdateBilling),
    RecordDispatch(RecordDispatch),
    RecordPayment(RecordPayment),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub order_number: String,
    pub pharmacy_id: PharmacyId,
    pub items: Vec<NewOrderItem>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderVoided {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemVoided {
    pub order_id: OrderId,
    pub order_item_id: OrderItemId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsReplaced {
    pub order_id: OrderId,
    pub items: Vec<NewOrderItem>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingUpdated {
    pub order_id: OrderId,
    pub salesman_name: String,
    pub delivery_type: String,
    pub terms: String,
    pub occurred_at: DateTime<Utc>,
}

/// A confirmed dispatch with its allocations. The matching `StockDrawn`
/// events in the product ledgers are committed atomically with this event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDispatched {
    pub order_id: OrderId,
    pub dispatch_id: DispatchId,
    pub allocations: Vec<Allocation>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecorded {
    pub order_id: OrderId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    Created(OrderCreated),
    StatusChanged(OrderStatusChanged),
    Voided(OrderVoided),
    ItemVoided(OrderItemVoided),
    ItemsReplaced(ItemsReplaced),
    BillingUpdated(BillingUpdated),
    Dispatched(OrderDispatched),
    PaymentRecorded(PaymentRecorded),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Created(_) => "orders.order.created",
            OrderEvent::StatusChanged(_) => "orders.order.status_changed",
            OrderEvent::Voided(_) => "orders.order.voided",
            OrderEvent::ItemVoided(_) => "orders.order.item_voided",
            OrderEvent::ItemsReplaced(_) => "orders.order.items_replaced",
            OrderEvent::BillingUpdated(_) => "orders.order.billing_updated",
            OrderEvent::Dispatched(_) => "orders.order.dispatched",
            OrderEvent::PaymentRecorded(_) => "orders.order.payment_recorded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::Created(e) => e.occurred_at,
            OrderEvent::StatusChanged(e) => e.occurred_at,
            OrderEvent::Voided(e) => e.occurred_at,
            OrderEvent::ItemVoided(e) => e.occurred_at,
            OrderEvent::ItemsReplaced(e) => e.occurred_at,
            OrderEvent::BillingUpdated(e) => e.occurred_at,
            OrderEvent::Dispatched(e) => e.occurred_at,
            OrderEvent::PaymentRecorded(e) => e.occurred_at,
        }
    }
}

fn materialize_items(items: &[NewOrderItem]) -> Vec<OrderItem> {
    items
        .iter()
        .map(|i| OrderItem {
            id: i.order_item_id,
            product_id: i.product_id,
            quantity: i.quantity,
            unit_price: i.unit_price,
            discount_amount: i.discount_amount,
            is_void: false,
        })
        .collect()
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = OrderError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Created(e) => {
                self.id = e.order_id;
                self.order_number = e.order_number.clone();
                self.pharmacy_id = e.pharmacy_id;
                self.items = materialize_items(&e.items);
                self.status = OrderStatus::Pending;
                self.created = true;
            }
            OrderEvent::StatusChanged(e) => {
                self.status = e.to;
            }
            OrderEvent::Voided(_) => {
                self.is_void = true;
                for item in &mut self.items {
                    item.is_void = true;
                }
            }
            OrderEvent::ItemVoided(e) => {
                let item = self
                    .items
                    .iter_mut()
                    .find(|i| i.id == e.order_item_id)
                    .unwrap_or_else(|| panic!("voided unknown item {}", e.order_item_id));
                item.is_void = true;
            }
            OrderEvent::ItemsReplaced(e) => {
                self.items = materialize_items(&e.items);
            }
            OrderEvent::BillingUpdated(e) => {
                self.salesman_name = e.salesman_name.clone();
                self.delivery_type = e.delivery_type.clone();
                self.terms = e.terms.clone();
            }
            OrderEvent::Dispatched(e) => {
                // A committed dispatch that overshoots remaining quantity is
                // a logic defect, never a recoverable condition.
                for allocation in &e.allocations {
                    let remaining = self.remaining_quantity(allocation.order_item_id);
                    assert!(
                        allocation.quantity <= remaining,
                        "item {} would go below zero remaining ({} > {})",
                        allocation.order_item_id,
                        allocation.quantity,
                        remaining
                    );
                    // remaining_quantity folds over self.dispatches, so push
                    // allocations one at a time to keep the check cumulative.
                    match self.dispatches.iter_mut().find(|d| d.id == e.dispatch_id) {
                        Some(record) => record.allocations.push(*allocation),
                        None => self.dispatches.push(DispatchRecord {
                            id: e.dispatch_id,
                            dispatched_at: e.occurred_at,
                            allocations: vec![*allocation],
                        }),
                    }
                }
            }
            OrderEvent::PaymentRecorded(e) => {
                assert!(e.amount > 0, "committed non-positive payment {}", e.amount);
                self.payments.push(PaymentRecord {
                    amount: e.amount,
                    recorded_at: e.occurred_at,
                });
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if !self.created && !matches!(command, OrderCommand::Create(_)) {
            let order_id = match command {
                OrderCommand::Transition(c) => c.order_id,
                OrderCommand::VoidOrder(c) => c.order_id,
                OrderCommand::VoidItem(c) => c.order_id,
                OrderCommand::ReplaceItems(c) => c.order_id,
                OrderCommand::UpdateBilling(c) => c.order_id,
                OrderCommand::RecordDispatch(c) => c.order_id,
                OrderCommand::RecordPayment(c) => c.order_id,
                OrderCommand::Create(_) => unreachable!(),
            };
            return Err(OrderError::NotFound { order_id });
        }

        match command {
            OrderCommand::Create(cmd) => self.handle_create(cmd),
            OrderCommand::Transition(cmd) => self.handle_transition(cmd),
            OrderCommand::VoidOrder(cmd) => self.handle_void_order(cmd),
            OrderCommand::VoidItem(cmd) => self.handle_void_item(cmd),
            OrderCommand::ReplaceItems(cmd) => self.handle_replace_items(cmd),
            OrderCommand::UpdateBilling(cmd) => self.handle_update_billing(cmd),
            OrderCommand::RecordDispatch(cmd) => self.handle_record_dispatch(cmd),
            OrderCommand::RecordPayment(cmd) => self.handle_record_payment(cmd),
        }
    }
}

impl Order {
    fn validate_items(items: &[NewOrderItem]) -> Result<(), OrderError> {
        if items.is_empty() {
            return Err(OrderError::Validation(
                "order must contain at least one item".to_string(),
            ));
        }
        for (index, item) in items.iter().enumerate() {
            if item.quantity < 1 {
                return Err(OrderError::Validation(format!(
                    "item {}: quantity must be at least 1",
                    index + 1
                )));
            }
            if item.unit_price < 0 {
                return Err(OrderError::Validation(format!(
                    "item {}: unit price cannot be negative",
                    index + 1
                )));
            }
            let gross = item.quantity.checked_mul(item.unit_price).ok_or_else(|| {
                OrderError::Validation(format!("item {}: line gross overflows", index + 1))
            })?;
            if item.discount_amount < 0 || item.discount_amount > gross {
                return Err(OrderError::Validation(format!(
                    "item {}: discount must be between 0 and the line gross",
                    index + 1
                )));
            }
        }
        let mut ids: Vec<OrderItemId> = items.iter().map(|i| i.order_item_id).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != items.len() {
            return Err(OrderError::Validation(
                "duplicate order item id".to_string(),
            ));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.created {
            return Err(OrderError::AlreadyExists { order_id: self.id });
        }
        if cmd.order_number.trim().is_empty() {
            return Err(OrderError::Validation(
                "order number cannot be empty".to_string(),
            ));
        }
        Self::validate_items(&cmd.items)?;

        Ok(vec![OrderEvent::Created(OrderCreated {
            order_id: cmd.order_id,
            order_number: cmd.order_number.trim().to_string(),
            pharmacy_id: cmd.pharmacy_id,
            items: cmd.items.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transition(&self, cmd: &TransitionOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_void {
            return Err(OrderError::OrderVoid { order_id: self.id });
        }
        if !self.status.can_transition_to(cmd.to) {
            return Err(OrderError::InvalidTransition(format!(
                "{} -> {}",
                self.status, cmd.to
            )));
        }

        Ok(vec![OrderEvent::StatusChanged(OrderStatusChanged {
            order_id: self.id,
            from: self.status,
            to: cmd.to,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_void_order(&self, cmd: &VoidOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_void {
            return Err(OrderError::AlreadyVoid(format!("order {}", self.id)));
        }

        Ok(vec![OrderEvent::Voided(OrderVoided {
            order_id: self.id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_void_item(&self, cmd: &VoidItem) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_void {
            return Err(OrderError::AlreadyVoid(format!("order {}", self.id)));
        }
        let item = self.item(cmd.order_item_id).ok_or(OrderError::UnknownItem {
            line: 1,
            order_item_id: cmd.order_item_id,
        })?;
        if item.is_void {
            return Err(OrderError::AlreadyVoid(format!("item {}", item.id)));
        }

        Ok(vec![OrderEvent::ItemVoided(OrderItemVoided {
            order_id: self.id,
            order_item_id: cmd.order_item_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_replace_items(&self, cmd: &ReplaceItems) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_void {
            return Err(OrderError::OrderVoid { order_id: self.id });
        }
        if !self.is_editable() {
            return Err(OrderError::InvalidTransition(
                "cannot edit line items after dispatch".to_string(),
            ));
        }
        Self::validate_items(&cmd.items)?;

        Ok(vec![OrderEvent::ItemsReplaced(ItemsReplaced {
            order_id: self.id,
            items: cmd.items.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_billing(&self, cmd: &UpdateBilling) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_void {
            return Err(OrderError::OrderVoid { order_id: self.id });
        }

        Ok(vec![OrderEvent::BillingUpdated(BillingUpdated {
            order_id: self.id,
            salesman_name: cmd.salesman_name.trim().to_string(),
            delivery_type: cmd.delivery_type.trim().to_string(),
            terms: cmd.terms.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Order-side dispatch validation. Batch capacity is the ledger's
    /// concern and is checked against freshly loaded ledger state by the
    /// engine, inside the same atomic append.
    fn handle_record_dispatch(&self, cmd: &RecordDispatch) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_void || !self.status.dispatchable() {
            return Err(OrderError::OrderNotDispatchable {
                status: self.status,
                is_void: self.is_void,
            });
        }
        if cmd.lines.is_empty() {
            return Err(OrderError::Validation(
                "dispatch must contain at least one line".to_string(),
            ));
        }

        // Several lines may target the same item; validate the cumulative
        // quantity against remaining, attributing failures to the first
        // offending line.
        let mut requested_per_item: Vec<(OrderItemId, i64)> = Vec::new();
        for (index, dispatch_line) in cmd.lines.iter().enumerate() {
            let line = index + 1;
            let item = self
                .item(dispatch_line.order_item_id)
                .ok_or(OrderError::UnknownItem {
                    line,
                    order_item_id: dispatch_line.order_item_id,
                })?;
            if item.is_void {
                return Err(OrderError::ItemVoided { line, order_item_id: item.id });
            }
            if dispatch_line.quantity < 1 {
                return Err(OrderError::Validation(format!(
                    "line {line}: quantity must be at least 1"
                )));
            }

            let cumulative = match requested_per_item.iter_mut().find(|(id, _)| *id == item.id) {
                Some((_, total)) => {
                    *total += dispatch_line.quantity;
                    *total
                }
                None => {
                    requested_per_item.push((item.id, dispatch_line.quantity));
                    dispatch_line.quantity
                }
            };
            let remaining = self.remaining_quantity(item.id);
            if cumulative > remaining {
                return Err(OrderError::InsufficientRemaining {
                    line,
                    order_item_id: item.id,
                    requested: cumulative,
                    remaining,
                });
            }
        }

        let allocations = cmd
            .lines
            .iter()
            .map(|l| Allocation {
                id: AllocationId::new(),
                order_item_id: l.order_item_id,
                batch_id: l.batch_id,
                quantity: l.quantity,
            })
            .collect();

        Ok(vec![OrderEvent::Dispatched(OrderDispatched {
            order_id: self.id,
            dispatch_id: cmd.dispatch_id,
            allocations,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_payment(&self, cmd: &RecordPayment) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_void {
            return Err(OrderError::OrderVoid { order_id: self.id });
        }
        if cmd.amount <= 0 {
            return Err(OrderError::InvalidAmount { amount: cmd.amount });
        }
        let outstanding = self.outstanding_amount();
        if cmd.amount > outstanding {
            return Err(OrderError::ExceedsOutstanding {
                amount: cmd.amount,
                outstanding,
            });
        }

        Ok(vec![OrderEvent::PaymentRecorded(PaymentRecorded {
            order_id: self.id,
            amount: cmd.amount,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn new_item(quantity: i64, unit_price: i64, discount: i64) -> NewOrderItem {
        NewOrderItem {
            order_item_id: OrderItemId::new(),
            product_id: ProductId(AggregateId::new()),
            quantity,
            unit_price,
            discount_amount: discount,
        }
    }

    fn run(order: &mut Order, cmd: OrderCommand) -> Result<Vec<OrderEvent>, OrderError> {
        let events = order.handle(&cmd)?;
        for e in &events {
            order.apply(e);
        }
        Ok(events)
    }

    fn created_order(items: Vec<NewOrderItem>) -> Order {
        let id = OrderId::new();
        let mut order = Order::empty(id);
        run(
            &mut order,
            OrderCommand::Create(CreateOrder {
                order_id: id,
                order_number: "ORD-1001".to_string(),
                pharmacy_id: PharmacyId::new(),
                items,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        order
    }

    fn approved_order(items: Vec<NewOrderItem>) -> Order {
        let mut order = created_order(items);
        let order_id = order.id_typed();
        run(
            &mut order,
            OrderCommand::Transition(TransitionOrder {
                order_id,
                to: OrderStatus::Approved,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        order
    }

    fn dispatch(
        order: &mut Order,
        lines: Vec<DispatchLine>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        run(
            order,
            OrderCommand::RecordDispatch(RecordDispatch {
                order_id: order.id_typed(),
                dispatch_id: DispatchId::new(),
                lines,
                occurred_at: Utc::now(),
            }),
        )
    }

    fn pay(order: &mut Order, amount: i64) -> Result<Vec<OrderEvent>, OrderError> {
        run(
            order,
            OrderCommand::RecordPayment(RecordPayment {
                order_id: order.id_typed(),
                amount,
                occurred_at: Utc::now(),
            }),
        )
    }

    #[test]
    fn status_machine_allows_only_forward_transitions() {
        let mut order = created_order(vec![new_item(10, 100, 0)]);
        let order_id = order.id_typed();

        let err = run(
            &mut order,
            OrderCommand::Transition(TransitionOrder {
                order_id,
                to: OrderStatus::Shipped,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition(_)));

        for to in [
            OrderStatus::Approved,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
        ] {
            run(
                &mut order,
                OrderCommand::Transition(TransitionOrder {
                    order_id,
                    to,
                    occurred_at: Utc::now(),
                }),
            )
            .unwrap();
        }
        assert_eq!(order.status(), OrderStatus::Delivered);
    }

    #[test]
    fn overflowing_line_values_are_rejected() {
        let id = OrderId::new();
        let order = Order::empty(id);
        let err = order
            .handle(&OrderCommand::Create(CreateOrder {
                order_id: id,
                order_number: "ORD-1001".to_string(),
                pharmacy_id: PharmacyId::new(),
                items: vec![new_item(i64::MAX / 2, 4, 0)],
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));
    }

    #[test]
    fn full_dispatch_zeroes_remaining_and_values_at_unit_price() {
        // One item, quantity 50 at 2000 paise, no discount. Two batches.
        let item = new_item(50, 2_000, 0);
        let item_id = item.order_item_id;
        let mut order = approved_order(vec![item]);

        let b1 = BatchId::new();
        let b2 = BatchId::new();
        dispatch(
            &mut order,
            vec![
                DispatchLine { order_item_id: item_id, batch_id: b1, quantity: 30 },
                DispatchLine { order_item_id: item_id, batch_id: b2, quantity: 20 },
            ],
        )
        .unwrap();

        assert_eq!(order.dispatched_quantity(item_id), 50);
        assert_eq!(order.remaining_quantity(item_id), 0);
        assert_eq!(order.dispatched_value(), 100_000);
        assert_eq!(order.dispatches().len(), 1);
        assert_eq!(order.dispatches()[0].allocations.len(), 2);
    }

    #[test]
    fn over_dispatch_is_rejected_without_mutation() {
        let item = new_item(50, 2_000, 0);
        let item_id = item.order_item_id;
        let mut order = approved_order(vec![item]);

        let err = dispatch(
            &mut order,
            vec![DispatchLine {
                order_item_id: item_id,
                batch_id: BatchId::new(),
                quantity: 60,
            }],
        )
        .unwrap_err();
        assert_eq!(
            err,
            OrderError::InsufficientRemaining {
                line: 1,
                order_item_id: item_id,
                requested: 60,
                remaining: 50,
            }
        );
        assert!(order.dispatches().is_empty());
    }

    #[test]
    fn duplicate_item_lines_are_validated_cumulatively() {
        let item = new_item(50, 2_000, 0);
        let item_id = item.order_item_id;
        let mut order = approved_order(vec![item]);

        let err = dispatch(
            &mut order,
            vec![
                DispatchLine { order_item_id: item_id, batch_id: BatchId::new(), quantity: 30 },
                DispatchLine { order_item_id: item_id, batch_id: BatchId::new(), quantity: 30 },
            ],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            OrderError::InsufficientRemaining { line: 2, requested: 60, remaining: 50, .. }
        ));
    }

    #[test]
    fn pending_and_rejected_orders_cannot_dispatch() {
        let item = new_item(10, 100, 0);
        let item_id = item.order_item_id;
        let mut order = created_order(vec![item]);

        let err = dispatch(
            &mut order,
            vec![DispatchLine { order_item_id: item_id, batch_id: BatchId::new(), quantity: 1 }],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            OrderError::OrderNotDispatchable { status: OrderStatus::Pending, .. }
        ));
    }

    #[test]
    fn payments_track_outstanding_against_dispatched_value() {
        let item = new_item(50, 2_000, 0);
        let item_id = item.order_item_id;
        let mut order = approved_order(vec![item]);
        dispatch(
            &mut order,
            vec![DispatchLine { order_item_id: item_id, batch_id: BatchId::new(), quantity: 50 }],
        )
        .unwrap();

        pay(&mut order, 60_000).unwrap();
        assert_eq!(order.outstanding_amount(), 40_000);
        assert_eq!(order.payment_status(), PaymentStatus::Partial);

        let err = pay(&mut order, 50_000).unwrap_err();
        assert_eq!(
            err,
            OrderError::ExceedsOutstanding { amount: 50_000, outstanding: 40_000 }
        );

        pay(&mut order, 40_000).unwrap();
        assert_eq!(order.outstanding_amount(), 0);
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
    }

    #[test]
    fn payment_requires_dispatched_value() {
        let mut order = approved_order(vec![new_item(10, 100, 0)]);
        // Nothing dispatched, so outstanding is zero.
        let err = pay(&mut order, 1).unwrap_err();
        assert!(matches!(err, OrderError::ExceedsOutstanding { outstanding: 0, .. }));

        let err = pay(&mut order, 0).unwrap_err();
        assert!(matches!(err, OrderError::InvalidAmount { .. }));
    }

    #[test]
    fn editing_is_blocked_after_dispatch() {
        let item = new_item(10, 100, 0);
        let item_id = item.order_item_id;
        let mut order = approved_order(vec![item.clone()]);
        let order_id = order.id_typed();

        // Pre-dispatch the line items may be freely replaced.
        run(
            &mut order,
            OrderCommand::ReplaceItems(ReplaceItems {
                order_id,
                items: vec![item, new_item(5, 100, 0)],
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert_eq!(order.items().len(), 2);

        dispatch(
            &mut order,
            vec![DispatchLine { order_item_id: item_id, batch_id: BatchId::new(), quantity: 1 }],
        )
        .unwrap();

        let err = run(
            &mut order,
            OrderCommand::ReplaceItems(ReplaceItems {
                order_id,
                items: vec![new_item(5, 100, 0)],
                occurred_at: Utc::now(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition(_)));
    }

    #[test]
    fn voiding_excludes_items_from_totals_and_dispatch() {
        let keep = new_item(10, 100, 0);
        let void = new_item(5, 200, 0);
        let void_id = void.order_item_id;
        let mut order = approved_order(vec![keep, void]);
        let order_id = order.id_typed();
        assert_eq!(order.total_amount(), 2_000);

        run(
            &mut order,
            OrderCommand::VoidItem(VoidItem {
                order_id,
                order_item_id: void_id,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert_eq!(order.total_amount(), 1_000);
        assert_eq!(order.remaining_quantity(void_id), 0);

        let err = dispatch(
            &mut order,
            vec![DispatchLine { order_item_id: void_id, batch_id: BatchId::new(), quantity: 1 }],
        )
        .unwrap_err();
        assert!(matches!(err, OrderError::ItemVoided { line: 1, .. }));

        // Double void of the same item.
        let err = run(
            &mut order,
            OrderCommand::VoidItem(VoidItem {
                order_id,
                order_item_id: void_id,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, OrderError::AlreadyVoid(_)));

        run(
            &mut order,
            OrderCommand::VoidOrder(VoidOrder { order_id, occurred_at: Utc::now() }),
        )
        .unwrap();
        assert!(order.is_void());
        assert_eq!(order.total_amount(), 0);
        assert!(order.items().iter().all(|i| i.is_void));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: over any sequence of partial dispatches, the sum of an
        /// item's allocations equals its dispatched quantity and remaining
        /// never drops below zero.
        #[test]
        fn allocations_reconcile_with_dispatched_quantity(
            ordered in 1i64..200,
            requests in prop::collection::vec(1i64..60, 0..12)
        ) {
            let item = new_item(ordered, 1_000, 0);
            let item_id = item.order_item_id;
            let mut order = approved_order(vec![item]);

            for qty in requests {
                let remaining = order.remaining_quantity(item_id);
                let result = dispatch(
                    &mut order,
                    vec![DispatchLine {
                        order_item_id: item_id,
                        batch_id: BatchId::new(),
                        quantity: qty,
                    }],
                );
                if qty <= remaining {
                    prop_assert!(result.is_ok());
                } else {
                    let rejected =
                        matches!(result, Err(OrderError::InsufficientRemaining { .. }));
                    prop_assert!(rejected);
                }

                let allocated: i64 = order
                    .dispatches()
                    .iter()
                    .flat_map(|d| &d.allocations)
                    .filter(|a| a.order_item_id == item_id)
                    .map(|a| a.quantity)
                    .sum();
                prop_assert_eq!(allocated, order.dispatched_quantity(item_id));
                prop_assert!(order.remaining_quantity(item_id) >= 0);
                prop_assert!(order.dispatched_quantity(item_id) <= ordered);
            }
        }

        /// Property: paid amount never exceeds dispatched value and
        /// outstanding is never negative.
        #[test]
        fn payments_never_exceed_dispatched_value(
            dispatched_qty in 1i64..100,
            amounts in prop::collection::vec(1i64..200_000, 0..10)
        ) {
            let item = new_item(dispatched_qty, 1_000, 0);
            let item_id = item.order_item_id;
            let mut order = approved_order(vec![item]);
            dispatch(
                &mut order,
                vec![DispatchLine {
                    order_item_id: item_id,
                    batch_id: BatchId::new(),
                    quantity: dispatched_qty,
                }],
            )
            .unwrap();

            for amount in amounts {
                let _ = pay(&mut order, amount);
                prop_assert!(order.paid_amount() <= order.dispatched_value());
                prop_assert!(order.outstanding_amount() >= 0);
            }
        }
    }
}
