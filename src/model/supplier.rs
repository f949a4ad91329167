use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type SupplierId = Uuid;

/// A supplier of purchase orders. Identity (`supplier_number`) is immutable
/// once created; contact fields may be overridden per-dispatch without
/// mutating the stored row (see `ContactOverride`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supplier {
    pub id: SupplierId,
    pub supplier_number: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub facility: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Optional per-call overrides for contact info, supplied by a manual
/// `trigger-call` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactOverride {
    pub phone_override: Option<String>,
    pub email_override: Option<String>,
}

impl ContactOverride {
    pub fn phone<'a>(&'a self, supplier: &'a Supplier) -> Option<&'a str> {
        self.phone_override.as_deref().or(supplier.phone.as_deref())
    }

    pub fn email<'a>(&'a self, supplier: &'a Supplier) -> Option<&'a str> {
        self.email_override.as_deref().or(supplier.email.as_deref())
    }
}
