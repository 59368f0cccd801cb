//! The fulfillment engine service.
//!
//! One facade over the domain aggregates. Every mutating operation follows
//! the same discipline: load the streams it touches, re-validate against the
//! freshly rehydrated state, append with an exact expected version per
//! stream (all-or-nothing across the batch), then publish. An optimistic
//! concurrency conflict triggers a bounded re-read/re-validate retry;
//! domain rejections are terminal.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use medsupply_core::{Aggregate, AggregateId};
use medsupply_events::{Event, EventBus, EventEnvelope};
use medsupply_inventory::{
    BatchDraw, BatchId, DrawStock, LedgerCommand, LedgerId, ReceiveStock, StockBatch, StockLedger,
    WriteOffBatch,
};
use medsupply_invoicing::{
    BillType, Invoice, InvoiceCommand, InvoiceId, InvoiceTotals, IssueInvoice, TotalsError,
    compute_invoice_totals,
};
use medsupply_orders::{
    CreateOrder, DispatchId, DispatchLine, Order, OrderCommand, OrderEvent, OrderId, OrderItemId,
    OrderStatus, RecordDispatch, RecordPayment, ReplaceItems, TransitionOrder, UpdateBilling,
    VoidItem, VoidOrder,
};
use medsupply_products::{
    CreateProduct, Product, ProductCommand, ProductId, SetProductActive, UpdatePricing,
};
use medsupply_purchasing::{
    ApprovePurchase, CreatePurchase, MarkPurchasePaid, Purchase, PurchaseCommand, PurchaseEvent,
    PurchaseId, ReceiptLine,
};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event_store::{EventStore, StoredEvent, StreamAppend};
use crate::executor::{load_aggregate, publish_committed, stream_append};

pub(crate) const PRODUCT_STREAM: &str = "products.product";
pub(crate) const LEDGER_STREAM: &str = "inventory.ledger";
pub(crate) const PURCHASE_STREAM: &str = "purchasing.purchase";
pub(crate) const ORDER_STREAM: &str = "orders.order";
pub(crate) const INVOICE_STREAM: &str = "invoicing.invoice";

/// Order fulfillment and batch-inventory reconciliation engine.
///
/// Generic over the event store and bus so tests run against the in-memory
/// implementations and a real backend can be swapped in without touching
/// domain code.
#[derive(Debug, Clone)]
pub struct FulfillmentEngine<S, B> {
    pub(crate) store: S,
    pub(crate) bus: B,
    pub(crate) config: EngineConfig,
}

impl<S, B> FulfillmentEngine<S, B> {
    pub fn new(store: S, bus: B, config: EngineConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<S, B> FulfillmentEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Re-run `op` after optimistic concurrency conflicts, up to the
    /// configured budget. Each attempt re-reads and re-validates; nothing is
    /// blindly resubmitted.
    fn with_conflict_retries<T>(
        &self,
        mut op: impl FnMut() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut attempts = 0u32;
        loop {
            match op() {
                Err(e) if e.is_retryable_conflict() => {
                    attempts += 1;
                    if attempts > self.config.max_conflict_retries {
                        return Err(EngineError::ConflictRetriesExhausted { attempts });
                    }
                    tracing::debug!(attempts, "concurrency conflict, re-reading");
                }
                other => return other,
            }
        }
    }

    /// Single-aggregate pipeline: load, decide, append, publish.
    fn execute<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        make: impl Fn(AggregateId) -> A,
        command: &A::Command,
    ) -> Result<Vec<StoredEvent>, EngineError>
    where
        A: Aggregate,
        A::Event: Event + Serialize + DeserializeOwned,
        EngineError: From<A::Error>,
    {
        self.with_conflict_retries(|| {
            let (aggregate, version) =
                load_aggregate(&self.store, aggregate_type, aggregate_id, &make)?;
            let decided = aggregate.handle(command)?;
            if decided.is_empty() {
                return Ok(vec![]);
            }
            let committed = self.store.append(vec![stream_append(
                aggregate_id,
                aggregate_type,
                version,
                &decided,
            )?])?;
            publish_committed(&self.bus, &committed)?;
            Ok(committed)
        })
    }

    fn append_and_publish(
        &self,
        appends: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EngineError> {
        let committed = self.store.append(appends)?;
        publish_committed(&self.bus, &committed)?;
        Ok(committed)
    }

    // ----- products -----

    pub fn create_product(&self, cmd: CreateProduct) -> Result<ProductId, EngineError> {
        let product_id = cmd.product_id;
        self.execute::<Product>(
            product_id.0,
            PRODUCT_STREAM,
            |id| Product::empty(ProductId(id)),
            &ProductCommand::CreateProduct(cmd),
        )?;
        Ok(product_id)
    }

    pub fn update_pricing(&self, cmd: UpdatePricing) -> Result<(), EngineError> {
        self.execute::<Product>(
            cmd.product_id.0,
            PRODUCT_STREAM,
            |id| Product::empty(ProductId(id)),
            &ProductCommand::UpdatePricing(cmd),
        )?;
        Ok(())
    }

    pub fn set_product_active(&self, cmd: SetProductActive) -> Result<(), EngineError> {
        self.execute::<Product>(
            cmd.product_id.0,
            PRODUCT_STREAM,
            |id| Product::empty(ProductId(id)),
            &ProductCommand::SetProductActive(cmd),
        )?;
        Ok(())
    }

    pub fn load_product(&self, product_id: ProductId) -> Result<Product, EngineError> {
        let (product, _) = load_aggregate(&self.store, PRODUCT_STREAM, product_id.0, |id| {
            Product::empty(ProductId(id))
        })?;
        if !product.exists() {
            return Err(EngineError::NotFound(format!("product {product_id}")));
        }
        Ok(product)
    }

    // ----- purchasing -----

    pub fn create_purchase(&self, cmd: CreatePurchase) -> Result<PurchaseId, EngineError> {
        let purchase_id = cmd.purchase_id;
        self.execute::<Purchase>(
            purchase_id.0,
            PURCHASE_STREAM,
            |id| Purchase::empty(PurchaseId(id)),
            &PurchaseCommand::Create(cmd),
        )?;
        Ok(purchase_id)
    }

    /// Approve a purchase: flips the purchase to approved and receives every
    /// line into its product's stock ledger, all in one atomic append.
    ///
    /// A second approval is rejected by the purchase aggregate, so ledger
    /// quantities can never double-increment.
    pub fn approve_purchase(
        &self,
        purchase_id: PurchaseId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.with_conflict_retries(|| {
            let (purchase, purchase_version) =
                load_aggregate(&self.store, PURCHASE_STREAM, purchase_id.0, |id| {
                    Purchase::empty(PurchaseId(id))
                })?;
            let decided = purchase.handle(&PurchaseCommand::Approve(ApprovePurchase {
                purchase_id,
                occurred_at: now,
            }))?;

            let lines: &[ReceiptLine] = match decided.first() {
                Some(PurchaseEvent::Approved(approved)) => &approved.lines,
                _ => &[],
            };

            let mut appends =
                vec![stream_append(purchase_id.0, PURCHASE_STREAM, purchase_version, &decided)?];
            appends.extend(self.receive_lines_into_ledgers(lines, now)?);

            self.append_and_publish(appends)?;
            tracing::info!(%purchase_id, lines = lines.len(), "purchase approved");
            Ok(())
        })
    }

    /// Build one ledger append per product touched by the receipt lines.
    fn receive_lines_into_ledgers(
        &self,
        lines: &[ReceiptLine],
        now: DateTime<Utc>,
    ) -> Result<Vec<StreamAppend>, EngineError> {
        let mut product_ids: Vec<ProductId> = lines.iter().map(|l| l.product_id).collect();
        product_ids.sort();
        product_ids.dedup();

        let mut appends = Vec::with_capacity(product_ids.len());
        for product_id in product_ids {
            let ledger_id = LedgerId::for_product(product_id);
            let (mut ledger, version) =
                load_aggregate(&self.store, LEDGER_STREAM, ledger_id.0, |id| {
                    StockLedger::empty(LedgerId(id))
                })?;

            let mut events = Vec::new();
            for line in lines.iter().filter(|l| l.product_id == product_id) {
                let decided = ledger.handle(&LedgerCommand::ReceiveStock(ReceiveStock {
                    ledger_id,
                    batch_id: BatchId::new(),
                    batch_number: line.batch_number.clone(),
                    expiry_date: line.expiry_date,
                    quantity: line.quantity,
                    occurred_at: now,
                }))?;
                // Apply as we go so a later line for the same batch number is
                // validated against the state this append will produce.
                for e in &decided {
                    ledger.apply(e);
                }
                events.extend(decided);
            }

            appends.push(stream_append(ledger_id.0, LEDGER_STREAM, version, &events)?);
        }
        Ok(appends)
    }

    pub fn mark_purchase_paid(
        &self,
        purchase_id: PurchaseId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<Purchase>(
            purchase_id.0,
            PURCHASE_STREAM,
            |id| Purchase::empty(PurchaseId(id)),
            &PurchaseCommand::MarkPaid(MarkPurchasePaid { purchase_id, occurred_at: now }),
        )?;
        Ok(())
    }

    pub fn load_purchase(&self, purchase_id: PurchaseId) -> Result<Purchase, EngineError> {
        let (purchase, _) = load_aggregate(&self.store, PURCHASE_STREAM, purchase_id.0, |id| {
            Purchase::empty(PurchaseId(id))
        })?;
        if !purchase.exists() {
            return Err(EngineError::NotFound(format!("purchase {purchase_id}")));
        }
        Ok(purchase)
    }

    // ----- inventory -----

    pub fn load_ledger(&self, product_id: ProductId) -> Result<StockLedger, EngineError> {
        let ledger_id = LedgerId::for_product(product_id);
        let (ledger, _) = load_aggregate(&self.store, LEDGER_STREAM, ledger_id.0, |id| {
            StockLedger::empty(LedgerId(id))
        })?;
        Ok(ledger)
    }

    /// Batches with remaining quantity for a product, expiry ascending.
    /// FEFO-first presentation; the operator may allocate from any of them.
    pub fn list_available_batches(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<StockBatch>, EngineError> {
        let ledger = self.load_ledger(product_id)?;
        Ok(ledger.available_batches().into_iter().cloned().collect())
    }

    /// Batches an operator can allocate against one order line. Resolves the
    /// line's product and lists its available batches, expiry ascending.
    pub fn list_available_batches_for_item(
        &self,
        order_id: OrderId,
        order_item_id: OrderItemId,
    ) -> Result<Vec<StockBatch>, EngineError> {
        let order = self.load_order(order_id)?;
        let product_id = order
            .item(order_item_id)
            .map(|item| item.product_id)
            .ok_or_else(|| EngineError::NotFound(format!("order item {order_item_id}")))?;
        self.list_available_batches(product_id)
    }

    pub fn write_off_batch(
        &self,
        product_id: ProductId,
        batch_id: BatchId,
        as_of: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let ledger_id = LedgerId::for_product(product_id);
        self.execute::<StockLedger>(
            ledger_id.0,
            LEDGER_STREAM,
            |id| StockLedger::empty(LedgerId(id)),
            &LedgerCommand::WriteOffBatch(WriteOffBatch {
                ledger_id,
                batch_id,
                as_of,
                occurred_at: now,
            }),
        )?;
        tracing::info!(%product_id, %batch_id, "expired batch written off");
        Ok(())
    }

    // ----- orders -----

    pub fn create_order(&self, cmd: CreateOrder) -> Result<OrderId, EngineError> {
        let order_id = cmd.order_id;
        self.execute::<Order>(
            order_id.0,
            ORDER_STREAM,
            |id| Order::empty(OrderId(id)),
            &OrderCommand::Create(cmd),
        )?;
        Ok(order_id)
    }

    pub fn transition_order(
        &self,
        order_id: OrderId,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<Order>(
            order_id.0,
            ORDER_STREAM,
            |id| Order::empty(OrderId(id)),
            &OrderCommand::Transition(TransitionOrder { order_id, to, occurred_at: now }),
        )?;
        Ok(())
    }

    pub fn void_order(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.execute::<Order>(
            order_id.0,
            ORDER_STREAM,
            |id| Order::empty(OrderId(id)),
            &OrderCommand::VoidOrder(VoidOrder { order_id, occurred_at: now }),
        )?;
        Ok(())
    }

    pub fn void_item(&self, cmd: VoidItem) -> Result<(), EngineError> {
        self.execute::<Order>(
            cmd.order_id.0,
            ORDER_STREAM,
            |id| Order::empty(OrderId(id)),
            &OrderCommand::VoidItem(cmd),
        )?;
        Ok(())
    }

    pub fn replace_items(&self, cmd: ReplaceItems) -> Result<(), EngineError> {
        self.execute::<Order>(
            cmd.order_id.0,
            ORDER_STREAM,
            |id| Order::empty(OrderId(id)),
            &OrderCommand::ReplaceItems(cmd),
        )?;
        Ok(())
    }

    pub fn update_billing(&self, cmd: UpdateBilling) -> Result<(), EngineError> {
        self.execute::<Order>(
            cmd.order_id.0,
            ORDER_STREAM,
            |id| Order::empty(OrderId(id)),
            &OrderCommand::UpdateBilling(cmd),
        )?;
        Ok(())
    }

    pub fn load_order(&self, order_id: OrderId) -> Result<Order, EngineError> {
        let (order, _) = load_aggregate(&self.store, ORDER_STREAM, order_id.0, |id| {
            Order::empty(OrderId(id))
        })?;
        if !order.exists() {
            return Err(EngineError::NotFound(format!("order {order_id}")));
        }
        Ok(order)
    }

    /// Confirm a dispatch: the central operation.
    ///
    /// Order-side validation (dispatchable status, live items, remaining
    /// quantities) happens in the order aggregate; batch capacity is checked
    /// against the freshly loaded ledgers, never a client-supplied snapshot.
    /// If any line fails, the whole dispatch is rejected with the offending
    /// line attributed. On success the order event and every batch decrement
    /// commit in one atomic append.
    pub fn confirm_dispatch(
        &self,
        order_id: OrderId,
        lines: Vec<DispatchLine>,
        now: DateTime<Utc>,
    ) -> Result<DispatchId, EngineError> {
        let dispatch_id = DispatchId::new();
        self.with_conflict_retries(|| {
            let (order, order_version) =
                load_aggregate(&self.store, ORDER_STREAM, order_id.0, |id| {
                    Order::empty(OrderId(id))
                })?;
            let decided = order.handle(&OrderCommand::RecordDispatch(RecordDispatch {
                order_id,
                dispatch_id,
                lines: lines.clone(),
                occurred_at: now,
            }))?;

            // Per-product batch draws, derived from the allocations the
            // order just decided.
            let mut draws_per_product: Vec<(ProductId, Vec<BatchDraw>)> = Vec::new();
            if let Some(OrderEvent::Dispatched(dispatched)) = decided.first() {
                for allocation in &dispatched.allocations {
                    let product_id = order
                        .item(allocation.order_item_id)
                        .map(|i| i.product_id)
                        .ok_or_else(|| {
                            EngineError::NotFound(format!(
                                "order item {}",
                                allocation.order_item_id
                            ))
                        })?;
                    let draw = BatchDraw {
                        batch_id: allocation.batch_id,
                        quantity: allocation.quantity,
                    };
                    match draws_per_product.iter_mut().find(|(p, _)| *p == product_id) {
                        Some((_, draws)) => draws.push(draw),
                        None => draws_per_product.push((product_id, vec![draw])),
                    }
                }
            }

            let mut appends =
                vec![stream_append(order_id.0, ORDER_STREAM, order_version, &decided)?];
            for (product_id, draws) in draws_per_product {
                let ledger_id = LedgerId::for_product(product_id);
                let (ledger, ledger_version) =
                    load_aggregate(&self.store, LEDGER_STREAM, ledger_id.0, |id| {
                        StockLedger::empty(LedgerId(id))
                    })?;
                let ledger_events = ledger.handle(&LedgerCommand::DrawStock(DrawStock {
                    ledger_id,
                    draws,
                    occurred_at: now,
                }))?;
                appends.push(stream_append(
                    ledger_id.0,
                    LEDGER_STREAM,
                    ledger_version,
                    &ledger_events,
                )?);
            }

            self.append_and_publish(appends)?;
            tracing::info!(%order_id, %dispatch_id, lines = lines.len(), "dispatch confirmed");
            Ok(dispatch_id)
        })
    }

    /// Record one payment against an order's outstanding balance. The
    /// balance is recomputed from the freshly loaded stream, closing the
    /// lost-update race between two concurrent recordings.
    pub fn record_payment(
        &self,
        order_id: OrderId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<Order>(
            order_id.0,
            ORDER_STREAM,
            |id| Order::empty(OrderId(id)),
            &OrderCommand::RecordPayment(RecordPayment { order_id, amount, occurred_at: now }),
        )?;
        tracing::info!(%order_id, amount, "payment recorded");
        Ok(())
    }

    /// Record payments against several orders. Each order is its own
    /// transaction boundary; one rejection does not roll back the others.
    pub fn record_payments(
        &self,
        payments: Vec<(OrderId, i64)>,
        now: DateTime<Utc>,
    ) -> Vec<(OrderId, Result<(), EngineError>)> {
        payments
            .into_iter()
            .map(|(order_id, amount)| {
                let result = self.record_payment(order_id, amount, now);
                (order_id, result)
            })
            .collect()
    }

    // ----- invoicing -----

    /// Issue (or fetch) the invoice registry entry for an order. Issuing is
    /// gated the same way totals are: no salesman of record, no invoice.
    pub fn invoice_for_order(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<Invoice, EngineError> {
        let order = self.load_order(order_id)?;
        if order.salesman_name().trim().is_empty() {
            return Err(EngineError::Totals(TotalsError::MissingBillingDetails { order_id }));
        }

        let invoice_id = InvoiceId::for_order(order_id);
        self.execute::<Invoice>(
            invoice_id.0,
            INVOICE_STREAM,
            |id| Invoice::empty(InvoiceId(id)),
            &InvoiceCommand::Issue(IssueInvoice {
                order_id,
                order_number: order.order_number().to_string(),
                occurred_at: now,
            }),
        )?;

        let (invoice, _) = load_aggregate(&self.store, INVOICE_STREAM, invoice_id.0, |id| {
            Invoice::empty(InvoiceId(id))
        })?;
        Ok(invoice)
    }

    /// Billing totals for an order, scoped by bill type. GST rates come from
    /// the product catalog at computation time.
    pub fn invoice_totals(
        &self,
        order_id: OrderId,
        bill_type: BillType,
    ) -> Result<InvoiceTotals, EngineError> {
        let order = self.load_order(order_id)?;

        let mut gst_rates_bp = std::collections::HashMap::new();
        for item in order.items() {
            if gst_rates_bp.contains_key(&item.product_id) {
                continue;
            }
            let (product, _) =
                load_aggregate(&self.store, PRODUCT_STREAM, item.product_id.0, |id| {
                    Product::empty(ProductId(id))
                })?;
            if product.exists() {
                gst_rates_bp.insert(item.product_id, i64::from(product.gst_rate_bp()));
            }
        }

        Ok(compute_invoice_totals(&order, bill_type, &gst_rates_bp)?)
    }
}
