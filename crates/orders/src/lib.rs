//! Order aggregate: line items, status state machine, dispatch recording and
//! the per-order payment ledger.
//!
//! Dispatched, paid and outstanding amounts are folds over the order's event
//! stream. Payments live in the same stream as append-only facts.

pub mod order;

pub use medsupply_inventory::BatchId;
pub use order::{
    Allocation, AllocationId, BillingUpdated, CreateOrder, DispatchId, DispatchLine,
    DispatchRecord, ItemsReplaced, NewOrderItem, Order, OrderCommand, OrderCreated,
    OrderDispatched, OrderError, OrderEvent, OrderId, OrderItem, OrderItemId, OrderItemVoided,
    OrderStatus, OrderStatusChanged, OrderVoided, PaymentRecord, PaymentRecorded, PaymentStatus,
    RecordDispatch, RecordPayment, ReplaceItems, TransitionOrder, UpdateBilling, VoidItem,
    VoidOrder,
};
