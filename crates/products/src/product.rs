use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medsupply_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use medsupply_events::Event;

/// Product identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: Product.
///
/// Amounts are in the smallest currency unit (paise); rates in basis points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    id: ProductId,
    name: String,
    mrp: i64,
    selling_price: i64,
    gst_rate_bp: u32,
    pack_size: u32,
    unit: String,
    default_discount_bp: u32,
    is_active: bool,
    version: u64,
    created: bool,
}

impl Product {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            name: String::new(),
            mrp: 0,
            selling_price: 0,
            gst_rate_bp: 0,
            pack_size: 0,
            unit: String::new(),
            default_discount_bp: 0,
            is_active: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mrp(&self) -> i64 {
        self.mrp
    }

    pub fn selling_price(&self) -> i64 {
        self.selling_price
    }

    pub fn gst_rate_bp(&self) -> u32 {
        self.gst_rate_bp
    }

    pub fn pack_size(&self) -> u32 {
        self.pack_size
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn default_discount_bp(&self) -> u32 {
        self.default_discount_bp
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn exists(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub product_id: ProductId,
    pub name: String,
    pub mrp: i64,
    pub selling_price: i64,
    pub gst_rate_bp: u32,
    pub pack_size: u32,
    pub unit: String,
    pub default_discount_bp: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdatePricing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePricing {
    pub product_id: ProductId,
    pub mrp: i64,
    pub selling_price: i64,
    pub gst_rate_bp: u32,
    pub default_discount_bp: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetProductActive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetProductActive {
    pub product_id: ProductId,
    pub active: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductCommand {
    CreateProduct(CreateProduct),
    UpdatePricing(UpdatePricing),
    SetProductActive(SetProductActive),
}

/// Event: ProductCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: ProductId,
    pub name: String,
    pub mrp: i64,
    pub selling_price: i64,
    pub gst_rate_bp: u32,
    pub pack_size: u32,
    pub unit: String,
    pub default_discount_bp: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PricingUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingUpdated {
    pub product_id: ProductId,
    pub mrp: i64,
    pub selling_price: i64,
    pub gst_rate_bp: u32,
    pub default_discount_bp: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductActiveSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductActiveSet {
    pub product_id: ProductId,
    pub active: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductEvent {
    ProductCreated(ProductCreated),
    PricingUpdated(PricingUpdated),
    ProductActiveSet(ProductActiveSet),
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::ProductCreated(_) => "products.product.created",
            ProductEvent::PricingUpdated(_) => "products.product.pricing_updated",
            ProductEvent::ProductActiveSet(_) => "products.product.active_set",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::ProductCreated(e) => e.occurred_at,
            ProductEvent::PricingUpdated(e) => e.occurred_at,
            ProductEvent::ProductActiveSet(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductEvent::ProductCreated(e) => {
                self.id = e.product_id;
                self.name = e.name.clone();
                self.mrp = e.mrp;
                self.selling_price = e.selling_price;
                self.gst_rate_bp = e.gst_rate_bp;
                self.pack_size = e.pack_size;
                self.unit = e.unit.clone();
                self.default_discount_bp = e.default_discount_bp;
                self.is_active = true;
                self.created = true;
            }
            ProductEvent::PricingUpdated(e) => {
                self.mrp = e.mrp;
                self.selling_price = e.selling_price;
                self.gst_rate_bp = e.gst_rate_bp;
                self.default_discount_bp = e.default_discount_bp;
            }
            ProductEvent::ProductActiveSet(e) => {
                self.is_active = e.active;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ProductCommand::CreateProduct(cmd) => self.handle_create(cmd),
            ProductCommand::UpdatePricing(cmd) => self.handle_update_pricing(cmd),
            ProductCommand::SetProductActive(cmd) => self.handle_set_active(cmd),
        }
    }
}

impl Product {
    fn validate_pricing(mrp: i64, selling_price: i64) -> Result<(), DomainError> {
        if mrp <= 0 || selling_price <= 0 {
            return Err(DomainError::validation("prices must be positive"));
        }
        if selling_price > mrp {
            return Err(DomainError::validation("selling price cannot exceed MRP"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateProduct) -> Result<Vec<ProductEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("product already exists"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.pack_size == 0 {
            return Err(DomainError::validation("pack size must be positive"));
        }
        Self::validate_pricing(cmd.mrp, cmd.selling_price)?;

        Ok(vec![ProductEvent::ProductCreated(ProductCreated {
            product_id: cmd.product_id,
            name: cmd.name.clone(),
            mrp: cmd.mrp,
            selling_price: cmd.selling_price,
            gst_rate_bp: cmd.gst_rate_bp,
            pack_size: cmd.pack_size,
            unit: cmd.unit.clone(),
            default_discount_bp: cmd.default_discount_bp,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_pricing(&self, cmd: &UpdatePricing) -> Result<Vec<ProductEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Self::validate_pricing(cmd.mrp, cmd.selling_price)?;

        Ok(vec![ProductEvent::PricingUpdated(PricingUpdated {
            product_id: cmd.product_id,
            mrp: cmd.mrp,
            selling_price: cmd.selling_price,
            gst_rate_bp: cmd.gst_rate_bp,
            default_discount_bp: cmd.default_discount_bp,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_active(&self, cmd: &SetProductActive) -> Result<Vec<ProductEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.is_active == cmd.active {
            return Ok(vec![]);
        }

        Ok(vec![ProductEvent::ProductActiveSet(ProductActiveSet {
            product_id: cmd.product_id,
            active: cmd.active,
            occurred_at: cmd.occurred_at,
        })])
    }
}
