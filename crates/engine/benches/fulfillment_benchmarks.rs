use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::Utc;
use medsupply_core::{AggregateId, PharmacyId};
use medsupply_engine::{EngineConfig, FulfillmentEngine, InMemoryEventStore};
use medsupply_events::{EventEnvelope, InMemoryEventBus};
use medsupply_orders::{CreateOrder, DispatchLine, NewOrderItem, OrderId, OrderItemId, OrderStatus};
use medsupply_products::{CreateProduct, ProductId};
use medsupply_purchasing::{CreatePurchase, PurchaseId, PurchaseItem};

type BenchEngine =
    FulfillmentEngine<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>>;

fn engine() -> BenchEngine {
    FulfillmentEngine::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemoryEventBus::new()),
        EngineConfig::default(),
    )
}

fn seed_product_with_stock(engine: &BenchEngine, quantity: i64) -> ProductId {
    let product_id = ProductId(AggregateId::new());
    engine
        .create_product(CreateProduct {
            product_id,
            name: "Benchmark Product".to_string(),
            mrp: 2_500,
            selling_price: 2_000,
            gst_rate_bp: 1_200,
            pack_size: 10,
            unit: "strip".to_string(),
            default_discount_bp: 0,
            occurred_at: Utc::now(),
        })
        .unwrap();

    let purchase_id = engine
        .create_purchase(CreatePurchase {
            purchase_id: PurchaseId::new(),
            supplier_name: "Benchmark Supplier".to_string(),
            items: vec![PurchaseItem {
                product_id,
                quantity,
                unit_price: 1_500,
                batch_number: Some("BENCH-1".to_string()),
                expiry_date: "2030-01-01".parse().unwrap(),
            }],
            occurred_at: Utc::now(),
        })
        .unwrap();
    engine.approve_purchase(purchase_id, Utc::now()).unwrap();
    product_id
}

fn approved_order(engine: &BenchEngine, product_id: ProductId, quantity: i64) -> (OrderId, OrderItemId) {
    let order_id = OrderId::new();
    let item_id = OrderItemId::new();
    engine
        .create_order(CreateOrder {
            order_id,
            order_number: format!("BENCH-{order_id}"),
            pharmacy_id: PharmacyId::new(),
            items: vec![NewOrderItem {
                order_item_id: item_id,
                product_id,
                quantity,
                unit_price: 2_000,
                discount_amount: 0,
            }],
            occurred_at: Utc::now(),
        })
        .unwrap();
    engine
        .transition_order(order_id, OrderStatus::Approved, Utc::now())
        .unwrap();
    (order_id, item_id)
}

fn bench_dispatch_confirmation(c: &mut Criterion) {
    let mut group = c.benchmark_group("confirm_dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_line", |b| {
        b.iter_batched(
            || {
                let engine = engine();
                let product_id = seed_product_with_stock(&engine, 1_000_000);
                let batch_id = engine.list_available_batches(product_id).unwrap()[0].id;
                let (order_id, item_id) = approved_order(&engine, product_id, 10);
                (engine, order_id, item_id, batch_id)
            },
            |(engine, order_id, item_id, batch_id)| {
                engine
                    .confirm_dispatch(
                        order_id,
                        vec![DispatchLine { order_item_id: item_id, batch_id, quantity: 10 }],
                        Utc::now(),
                    )
                    .unwrap()
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_order_rehydration(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_rehydration");

    for dispatch_count in [1u32, 10, 50] {
        let engine = engine();
        let product_id = seed_product_with_stock(&engine, 1_000_000);
        let batch_id = engine.list_available_batches(product_id).unwrap()[0].id;
        let (order_id, item_id) = approved_order(&engine, product_id, i64::from(dispatch_count));
        for _ in 0..dispatch_count {
            engine
                .confirm_dispatch(
                    order_id,
                    vec![DispatchLine { order_item_id: item_id, batch_id, quantity: 1 }],
                    Utc::now(),
                )
                .unwrap();
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(dispatch_count),
            &dispatch_count,
            |b, _| b.iter(|| black_box(engine.load_order(order_id).unwrap())),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch_confirmation, bench_order_rehydration);
criterion_main!(benches);
