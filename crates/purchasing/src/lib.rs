//! Purchase intake: supplier purchase records that feed the stock ledgers
//! on approval.

pub mod purchase;

pub use purchase::{
    ApprovePurchase, CreatePurchase, MarkPurchasePaid, Purchase, PurchaseApproved, PurchaseCommand,
    PurchaseCreated, PurchaseError, PurchaseEvent, PurchaseId, PurchaseItem, PurchasePaid,
    PurchaseStatus, ReceiptLine,
};
