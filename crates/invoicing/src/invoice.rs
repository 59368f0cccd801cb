use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use medsupply_core::{Aggregate, AggregateId, AggregateRoot};
use medsupply_events::Event;
use medsupply_orders::OrderId;

/// Invoice identifier. An invoice stream shares its order's aggregate id,
/// which is what makes "one invoice number per order" trivially enforceable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn for_order(order_id: OrderId) -> Self {
        Self(order_id.0)
    }

    pub fn order_id(&self) -> OrderId {
        OrderId(self.0)
    }
}

impl core::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvoiceError {
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Aggregate root: the invoice number registry entry for one order.
///
/// A one-event aggregate: issuing is idempotent (the number is derived from
/// the order number, so re-issuing cannot produce a different invoice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    id: InvoiceId,
    invoice_number: String,
    issued_at: Option<DateTime<Utc>>,
    version: u64,
}

impl Invoice {
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            invoice_number: String::new(),
            issued_at: None,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn is_issued(&self) -> bool {
        self.issued_at.is_some()
    }

    pub fn invoice_number(&self) -> &str {
        &self.invoice_number
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInvoice {
    pub order_id: OrderId,
    pub order_number: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    Issue(IssueInvoice),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceIssued {
    pub invoice_id: InvoiceId,
    pub order_id: OrderId,
    pub invoice_number: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    Issued(InvoiceIssued),
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::Issued(_) => "invoicing.invoice.issued",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::Issued(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = InvoiceError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::Issued(e) => {
                assert!(self.issued_at.is_none(), "invoice {} issued twice", self.id);
                self.id = e.invoice_id;
                self.invoice_number = e.invoice_number.clone();
                self.issued_at = Some(e.occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::Issue(cmd) => {
                if self.is_issued() {
                    return Ok(Vec::new());
                }
                if cmd.order_number.trim().is_empty() {
                    return Err(InvoiceError::Validation(
                        "order number cannot be empty".to_string(),
                    ));
                }

                Ok(vec![InvoiceEvent::Issued(InvoiceIssued {
                    invoice_id: InvoiceId::for_order(cmd.order_id),
                    order_id: cmd.order_id,
                    invoice_number: format!("INV-{}", cmd.order_number.trim()),
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuing_is_idempotent_and_number_tracks_order_number() {
        let order_id = OrderId::new();
        let mut invoice = Invoice::empty(InvoiceId::for_order(order_id));

        let cmd = InvoiceCommand::Issue(IssueInvoice {
            order_id,
            order_number: "ORD-1001".to_string(),
            occurred_at: Utc::now(),
        });
        let events = invoice.handle(&cmd).unwrap();
        assert_eq!(events.len(), 1);
        for e in &events {
            invoice.apply(e);
        }
        assert!(invoice.is_issued());
        assert_eq!(invoice.invoice_number(), "INV-ORD-1001");

        let repeat = invoice.handle(&cmd).unwrap();
        assert!(repeat.is_empty());
    }
}
