//! Product catalog aggregate: pricing, pack data, activity flag.
//!
//! Note: a product's `stock_quantity` is *not* state here; it is derived from
//! the product's stock ledger (see `medsupply-inventory`).

pub mod product;

pub use product::{
    CreateProduct, PricingUpdated, Product, ProductActiveSet, ProductCommand, ProductCreated,
    ProductEvent, ProductId, SetProductActive, UpdatePricing,
};
