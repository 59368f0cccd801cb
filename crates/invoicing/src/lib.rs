//! Invoice registry and billing totals.
//!
//! Rendering (PDF layout) is an external collaborator; this crate only
//! issues invoice numbers and computes the totals a renderer consumes.

pub mod invoice;
pub mod totals;

pub use invoice::{
    Invoice, InvoiceCommand, InvoiceError, InvoiceEvent, InvoiceId, InvoiceIssued, IssueInvoice,
};
pub use totals::{BillType, InvoiceLine, InvoiceTotals, TotalsError, compute_invoice_totals};
