//! Reporting reads: computed views over the event streams.
//!
//! Every figure here is a fold over the same streams the commands append to;
//! nothing is stored separately, so the reports can never drift from the
//! ledger. Read-only, no locking beyond the store's snapshot consistency.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value as JsonValue;

use medsupply_core::PharmacyId;
use medsupply_events::{EventBus, EventEnvelope};
use medsupply_inventory::{BatchId, ExpiryStatus, LedgerId, StockLedger, classify_expiry};
use medsupply_invoicing::{Invoice, InvoiceId};
use medsupply_orders::{Order, OrderId, OrderStatus, PaymentStatus};
use medsupply_products::{Product, ProductId};

use crate::error::EngineError;
use crate::event_store::EventStore;
use crate::executor::load_aggregate;
use crate::service::{
    FulfillmentEngine, INVOICE_STREAM, LEDGER_STREAM, ORDER_STREAM, PRODUCT_STREAM,
};

/// Per-order money view used by the payments screens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub order_number: String,
    pub pharmacy_id: PharmacyId,
    pub status: OrderStatus,
    pub is_void: bool,
    pub total_amount: i64,
    pub dispatched_amount: i64,
    pub paid_amount: i64,
    pub outstanding_amount: i64,
    pub payment_status: PaymentStatus,
}

/// Shortfall per active product: open-order demand against in-hand stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockRequirementRow {
    pub product_id: ProductId,
    pub product_name: String,
    pub required: i64,
    pub in_hand: i64,
    pub shortfall: i64,
    pub to_purchase: i64,
}

/// Ordered vs dispatched, per order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderFulfillmentRow {
    pub order_id: OrderId,
    pub order_number: String,
    pub ordered_quantity: i64,
    pub dispatched_quantity: i64,
}

/// Ordered vs dispatched, per product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductFulfillmentRow {
    pub product_id: ProductId,
    pub ordered_quantity: i64,
    pub dispatched_quantity: i64,
}

/// Outstanding balance grouped by ordering store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreOutstandingRow {
    pub pharmacy_id: PharmacyId,
    pub outstanding_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceSummary {
    pub order_id: OrderId,
    pub invoice_number: String,
    pub issued_at: chrono::DateTime<chrono::Utc>,
}

/// One stocked batch with its advisory expiry classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchExpiryRow {
    pub product_id: ProductId,
    pub batch_id: BatchId,
    pub batch_number: String,
    pub expiry_date: NaiveDate,
    pub quantity: i64,
    pub status: ExpiryStatus,
}

/// Order statuses that count toward open demand.
fn contributes_demand(status: OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Pending | OrderStatus::Approved | OrderStatus::Processing | OrderStatus::Shipped
    )
}

impl<S, B> FulfillmentEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn load_all_orders(&self) -> Result<Vec<Order>, EngineError> {
        self.store
            .stream_ids(ORDER_STREAM)?
            .into_iter()
            .map(|id| {
                load_aggregate(&self.store, ORDER_STREAM, id, |id| Order::empty(OrderId(id)))
                    .map(|(order, _)| order)
            })
            .collect()
    }

    fn load_all_products(&self) -> Result<Vec<Product>, EngineError> {
        self.store
            .stream_ids(PRODUCT_STREAM)?
            .into_iter()
            .map(|id| {
                load_aggregate(&self.store, PRODUCT_STREAM, id, |id| Product::empty(ProductId(id)))
                    .map(|(product, _)| product)
            })
            .collect()
    }

    pub fn order_summary(&self, order_id: OrderId) -> Result<OrderSummary, EngineError> {
        let order = self.load_order(order_id)?;
        Ok(summarize(&order))
    }

    /// Per-product purchase requirements: open-order demand minus in-hand
    /// stock, floored at zero. No safety-stock buffer; operators raise
    /// purchase quantities manually where they want one.
    pub fn stock_requirements(&self) -> Result<Vec<StockRequirementRow>, EngineError> {
        let orders = self.load_all_orders()?;
        let mut rows = Vec::new();

        for product in self.load_all_products()? {
            if !product.is_active() {
                continue;
            }
            let product_id = product.id_typed();

            let required: i64 = orders
                .iter()
                .filter(|o| !o.is_void() && contributes_demand(o.status()))
                .flat_map(|o| {
                    o.items()
                        .iter()
                        .filter(|i| !i.is_void && i.product_id == product_id)
                        .map(|i| o.remaining_quantity(i.id))
                })
                .sum();

            let in_hand = self.load_ledger(product_id)?.on_hand();
            let shortfall = (required - in_hand).max(0);
            rows.push(StockRequirementRow {
                product_id,
                product_name: product.name().to_string(),
                required,
                in_hand,
                shortfall,
                to_purchase: shortfall,
            });
        }

        Ok(rows)
    }

    pub fn fulfillment_by_order(&self) -> Result<Vec<OrderFulfillmentRow>, EngineError> {
        Ok(self
            .load_all_orders()?
            .iter()
            .filter(|o| !o.is_void())
            .map(|order| {
                let (ordered, dispatched) = order
                    .items()
                    .iter()
                    .filter(|i| !i.is_void)
                    .fold((0, 0), |(ordered, dispatched), item| {
                        (
                            ordered + item.quantity,
                            dispatched + order.dispatched_quantity(item.id),
                        )
                    });
                OrderFulfillmentRow {
                    order_id: order.id_typed(),
                    order_number: order.order_number().to_string(),
                    ordered_quantity: ordered,
                    dispatched_quantity: dispatched,
                }
            })
            .collect())
    }

    pub fn fulfillment_by_product(&self) -> Result<Vec<ProductFulfillmentRow>, EngineError> {
        let mut rows: Vec<ProductFulfillmentRow> = Vec::new();
        for order in self.load_all_orders()?.iter().filter(|o| !o.is_void()) {
            for item in order.items().iter().filter(|i| !i.is_void) {
                let dispatched = order.dispatched_quantity(item.id);
                match rows.iter_mut().find(|r| r.product_id == item.product_id) {
                    Some(row) => {
                        row.ordered_quantity += item.quantity;
                        row.dispatched_quantity += dispatched;
                    }
                    None => rows.push(ProductFulfillmentRow {
                        product_id: item.product_id,
                        ordered_quantity: item.quantity,
                        dispatched_quantity: dispatched,
                    }),
                }
            }
        }
        Ok(rows)
    }

    /// Outstanding balances grouped by store, stores with nothing owed
    /// omitted.
    pub fn outstanding_by_store(&self) -> Result<Vec<StoreOutstandingRow>, EngineError> {
        let mut rows: Vec<StoreOutstandingRow> = Vec::new();
        for order in self.load_all_orders()?.iter().filter(|o| !o.is_void()) {
            let outstanding = order.outstanding_amount();
            if outstanding == 0 {
                continue;
            }
            match rows.iter_mut().find(|r| r.pharmacy_id == order.pharmacy_id()) {
                Some(row) => row.outstanding_amount += outstanding,
                None => rows.push(StoreOutstandingRow {
                    pharmacy_id: order.pharmacy_id(),
                    outstanding_amount: outstanding,
                }),
            }
        }
        Ok(rows)
    }

    pub fn invoice_list(&self) -> Result<Vec<InvoiceSummary>, EngineError> {
        let mut rows = Vec::new();
        for id in self.store.stream_ids(INVOICE_STREAM)? {
            let (invoice, _) = load_aggregate::<Invoice, _>(&self.store, INVOICE_STREAM, id, |id| {
                Invoice::empty(InvoiceId(id))
            })?;
            if let Some(issued_at) = invoice.issued_at() {
                rows.push(InvoiceSummary {
                    order_id: invoice.id_typed().order_id(),
                    invoice_number: invoice.invoice_number().to_string(),
                    issued_at,
                });
            }
        }
        Ok(rows)
    }

    /// Advisory expiry classification of every stocked batch, for the stock
    /// screens. Does not block allocation from an expired batch.
    pub fn expiry_overview(&self, today: NaiveDate) -> Result<Vec<BatchExpiryRow>, EngineError> {
        let window = self.config.expiring_soon_window_days;
        let mut rows = Vec::new();
        for id in self.store.stream_ids(LEDGER_STREAM)? {
            let (ledger, _) =
                load_aggregate::<StockLedger, _>(&self.store, LEDGER_STREAM, id, |id| {
                    StockLedger::empty(LedgerId(id))
                })?;
            let product_id = ledger.id_typed().product_id();
            for batch in ledger.batches().iter().filter(|b| b.quantity > 0) {
                rows.push(BatchExpiryRow {
                    product_id,
                    batch_id: batch.id,
                    batch_number: batch.batch_number.clone(),
                    expiry_date: batch.expiry_date,
                    quantity: batch.quantity,
                    status: classify_expiry(batch.expiry_date, today, window),
                });
            }
        }
        rows.sort_by(|a, b| a.expiry_date.cmp(&b.expiry_date));
        Ok(rows)
    }
}

fn summarize(order: &Order) -> OrderSummary {
    OrderSummary {
        order_id: order.id_typed(),
        order_number: order.order_number().to_string(),
        pharmacy_id: order.pharmacy_id(),
        status: order.status(),
        is_void: order.is_void(),
        total_amount: order.total_amount(),
        dispatched_amount: order.dispatched_value(),
        paid_amount: order.paid_amount(),
        outstanding_amount: order.outstanding_amount(),
        payment_status: order.payment_status(),
    }
}
