//! Billing totals, scoped to one dispatch or to the whole order.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use medsupply_orders::{Allocation, DispatchId, Order, OrderId, OrderItemId};
use medsupply_products::ProductId;

/// What a bill covers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "scope")]
pub enum BillType {
    /// The whole order: dispatched value, or the full order value when
    /// nothing has been dispatched yet (pre-approval invoices).
    Overall,
    /// One named dispatch.
    Dispatch(DispatchId),
    /// All allocations dispatched on one calendar date. Kept for orders
    /// predating named dispatches; a day is treated as one logical dispatch.
    DispatchDate(NaiveDate),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TotalsError {
    #[error("order {order_id} has no salesman of record; cannot emit an invoice")]
    MissingBillingDetails { order_id: OrderId },

    #[error("order has no dispatch {dispatch_id}")]
    UnknownDispatch { dispatch_id: DispatchId },

    #[error("order has no dispatches on {date}")]
    EmptyDispatchDate { date: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub order_item_id: OrderItemId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: i64,
    /// quantity x unit price, before discount.
    pub gross: i64,
    pub gst: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub bill_type: BillType,
    pub lines: Vec<InvoiceLine>,
    pub subtotal: i64,
    /// Flat line discounts, applied once on the overall bill only. Always
    /// zero for dispatch-scoped bills so partial dispatches can never
    /// double-count it.
    pub discount_total: i64,
    pub gst_total: i64,
    pub grand_total: i64,
}

/// Compute billing totals for an order.
///
/// `gst_rates_bp` maps each product to its GST rate in basis points; a
/// product missing from the map is billed untaxed.
///
/// Gated on billing details: no invoice may be produced without a salesman
/// of record on the order.
pub fn compute_invoice_totals(
    order: &Order,
    bill_type: BillType,
    gst_rates_bp: &HashMap<ProductId, i64>,
) -> Result<InvoiceTotals, TotalsError> {
    if order.salesman_name().trim().is_empty() {
        return Err(TotalsError::MissingBillingDetails { order_id: order.id_typed() });
    }

    let (quantities, discount_total) = match bill_type {
        BillType::Overall => {
            let dispatched = order.dispatched_value() > 0;
            let quantities: Vec<(OrderItemId, i64)> = order
                .items()
                .iter()
                .filter(|i| !i.is_void)
                .map(|i| {
                    let qty = if dispatched {
                        order.dispatched_quantity(i.id)
                    } else {
                        i.quantity
                    };
                    (i.id, qty)
                })
                .collect();
            let discount: i64 = order
                .items()
                .iter()
                .filter(|i| !i.is_void)
                .map(|i| i.discount_amount)
                .sum();
            (quantities, discount)
        }
        BillType::Dispatch(dispatch_id) => {
            let record = order
                .dispatch(dispatch_id)
                .ok_or(TotalsError::UnknownDispatch { dispatch_id })?;
            (sum_allocations(&record.allocations), 0)
        }
        BillType::DispatchDate(date) => {
            let allocations: Vec<Allocation> = order
                .dispatches()
                .iter()
                .filter(|d| d.dispatched_at.date_naive() == date)
                .flat_map(|d| d.allocations.iter().copied())
                .collect();
            if allocations.is_empty() {
                return Err(TotalsError::EmptyDispatchDate { date });
            }
            (sum_allocations(&allocations), 0)
        }
    };

    let mut lines = Vec::new();
    for (order_item_id, quantity) in quantities {
        if quantity == 0 {
            continue;
        }
        // An item voided after dispatch drops out of every bill.
        let Some(item) = order.item(order_item_id).filter(|i| !i.is_void) else {
            continue;
        };
        let gross = quantity * item.unit_price;
        let rate_bp = gst_rates_bp.get(&item.product_id).copied().unwrap_or(0);
        lines.push(InvoiceLine {
            order_item_id,
            product_id: item.product_id,
            quantity,
            unit_price: item.unit_price,
            gross,
            gst: gross * rate_bp / 10_000,
        });
    }

    let subtotal: i64 = lines.iter().map(|l| l.gross).sum();
    let gst_total: i64 = lines.iter().map(|l| l.gst).sum();

    Ok(InvoiceTotals {
        bill_type,
        subtotal,
        discount_total,
        gst_total,
        grand_total: subtotal - discount_total + gst_total,
        lines,
    })
}

fn sum_allocations(allocations: &[Allocation]) -> Vec<(OrderItemId, i64)> {
    let mut totals: Vec<(OrderItemId, i64)> = Vec::new();
    for allocation in allocations {
        match totals.iter_mut().find(|(id, _)| *id == allocation.order_item_id) {
            Some((_, qty)) => *qty += allocation.quantity,
            None => totals.push((allocation.order_item_id, allocation.quantity)),
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medsupply_core::{Aggregate, AggregateId, PharmacyId};
    use medsupply_orders::{
        BatchId, CreateOrder, DispatchLine, NewOrderItem, OrderCommand, OrderStatus,
        RecordDispatch, TransitionOrder, UpdateBilling,
    };

    fn run(order: &mut Order, cmd: OrderCommand) {
        let events = order.handle(&cmd).unwrap();
        for e in &events {
            order.apply(e);
        }
    }

    fn billed_order(quantity: i64, unit_price: i64, discount: i64) -> (Order, OrderItemId, ProductId) {
        let order_id = OrderId::new();
        let product_id = ProductId(AggregateId::new());
        let item_id = OrderItemId::new();
        let mut order = Order::empty(order_id);
        run(
            &mut order,
            OrderCommand::Create(CreateOrder {
                order_id,
                order_number: "ORD-42".to_string(),
                pharmacy_id: PharmacyId::new(),
                items: vec![NewOrderItem {
                    order_item_id: item_id,
                    product_id,
                    quantity,
                    unit_price,
                    discount_amount: discount,
                }],
                occurred_at: Utc::now(),
            }),
        );
        run(
            &mut order,
            OrderCommand::Transition(TransitionOrder {
                order_id,
                to: OrderStatus::Approved,
                occurred_at: Utc::now(),
            }),
        );
        (order, item_id, product_id)
    }

    fn set_salesman(order: &mut Order) {
        run(
            order,
            OrderCommand::UpdateBilling(UpdateBilling {
                order_id: order.id_typed(),
                salesman_name: "R. Gupta".to_string(),
                delivery_type: "courier".to_string(),
                terms: "net 30".to_string(),
                occurred_at: Utc::now(),
            }),
        );
    }

    fn dispatch(order: &mut Order, item_id: OrderItemId, quantity: i64) -> DispatchId {
        let dispatch_id = DispatchId::new();
        run(
            order,
            OrderCommand::RecordDispatch(RecordDispatch {
                order_id: order.id_typed(),
                dispatch_id,
                lines: vec![DispatchLine {
                    order_item_id: item_id,
                    batch_id: BatchId::new(),
                    quantity,
                }],
                occurred_at: Utc::now(),
            }),
        );
        dispatch_id
    }

    #[test]
    fn overall_bill_requires_billing_details() {
        let (mut order, item_id, _) = billed_order(50, 2_000, 0);
        dispatch(&mut order, item_id, 50);

        let err =
            compute_invoice_totals(&order, BillType::Overall, &HashMap::new()).unwrap_err();
        assert!(matches!(err, TotalsError::MissingBillingDetails { .. }));

        set_salesman(&mut order);
        let totals = compute_invoice_totals(&order, BillType::Overall, &HashMap::new()).unwrap();
        assert_eq!(totals.subtotal, 100_000);
        assert_eq!(totals.grand_total, 100_000);
    }

    #[test]
    fn overall_bill_falls_back_to_order_value_before_dispatch() {
        let (mut order, _, _) = billed_order(10, 1_000, 500);
        set_salesman(&mut order);

        let totals = compute_invoice_totals(&order, BillType::Overall, &HashMap::new()).unwrap();
        assert_eq!(totals.subtotal, 10_000);
        assert_eq!(totals.discount_total, 500);
        assert_eq!(totals.grand_total, 9_500);
    }

    #[test]
    fn dispatch_bill_is_gross_of_discount() {
        let (mut order, item_id, _) = billed_order(10, 1_000, 500);
        set_salesman(&mut order);
        let first = dispatch(&mut order, item_id, 4);
        dispatch(&mut order, item_id, 6);

        let totals =
            compute_invoice_totals(&order, BillType::Dispatch(first), &HashMap::new()).unwrap();
        assert_eq!(totals.subtotal, 4_000);
        assert_eq!(totals.discount_total, 0);
        assert_eq!(totals.grand_total, 4_000);

        let err = compute_invoice_totals(
            &order,
            BillType::Dispatch(DispatchId::new()),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TotalsError::UnknownDispatch { .. }));
    }

    #[test]
    fn dispatch_date_bill_groups_a_day_as_one_dispatch() {
        let (mut order, item_id, _) = billed_order(10, 1_000, 0);
        set_salesman(&mut order);
        dispatch(&mut order, item_id, 4);
        dispatch(&mut order, item_id, 3);

        let today = Utc::now().date_naive();
        let totals =
            compute_invoice_totals(&order, BillType::DispatchDate(today), &HashMap::new())
                .unwrap();
        assert_eq!(totals.subtotal, 7_000);
        assert_eq!(totals.lines.len(), 1);
        assert_eq!(totals.lines[0].quantity, 7);

        let empty_day = "1999-01-01".parse().unwrap();
        let err =
            compute_invoice_totals(&order, BillType::DispatchDate(empty_day), &HashMap::new())
                .unwrap_err();
        assert!(matches!(err, TotalsError::EmptyDispatchDate { .. }));
    }

    #[test]
    fn gst_is_applied_per_line_from_the_rate_map() {
        let (mut order, item_id, product_id) = billed_order(10, 1_000, 0);
        set_salesman(&mut order);
        dispatch(&mut order, item_id, 10);

        let mut rates = HashMap::new();
        rates.insert(product_id, 1_200); // 12%
        let totals = compute_invoice_totals(&order, BillType::Overall, &rates).unwrap();
        assert_eq!(totals.gst_total, 1_200);
        assert_eq!(totals.grand_total, 11_200);
    }
}
