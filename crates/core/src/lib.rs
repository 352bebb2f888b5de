pub mod address;
pub mod error;
pub mod models;
pub mod parsing;
pub mod validation;

pub use address::Address;
pub use error::ValidationError;
pub use models::{
    is_placeholder_hash, AddressSubscription, BaseUnits, Invoice, InvoiceForm, InvoiceStatus,
    StoredTransaction, TxStatus, PLACEHOLDER_HASH_PREFIX,
};
