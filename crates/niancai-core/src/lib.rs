//! Core domain model for the niancai meal-plan catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "niancai-core";

/// Canonical shipping-mode representation.
///
/// Vendor pages historically emit either a single mode string (`"宅配"`) or a
/// list of modes; both legacy forms funnel through [`ShippingModes::reconcile`]
/// and callers only ever read the canonical list or the derived scalar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShippingModes {
    modes: Vec<String>,
}

impl ShippingModes {
    /// Total conversion from the two legacy wire forms. A non-empty list wins;
    /// otherwise the scalar becomes a one-element list; blank input yields the
    /// empty value.
    pub fn reconcile(scalar: Option<String>, list: Option<Vec<String>>) -> Self {
        let mut modes: Vec<String> = list
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if modes.is_empty() {
            if let Some(single) = scalar {
                let single = single.trim().to_string();
                if !single.is_empty() {
                    modes.push(single);
                }
            }
        }
        modes.dedup();
        Self { modes }
    }

    pub fn from_list(modes: Vec<String>) -> Self {
        Self::reconcile(None, Some(modes))
    }

    /// Derived scalar form: the first mode, if any.
    pub fn primary(&self) -> Option<&str> {
        self.modes.first().map(String::as_str)
    }

    pub fn as_list(&self) -> &[String] {
        &self.modes
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Inverse of [`ShippingModes::reconcile`]: the `(scalar, list)` pair a
    /// legacy consumer expects.
    pub fn into_legacy_forms(self) -> (Option<String>, Vec<String>) {
        (self.modes.first().cloned(), self.modes)
    }
}

/// A vendor meal-plan record extracted from one page, before merging into the
/// catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub vendor_name: String,
    pub title: String,
    /// Sale price in TWD.
    pub price: i64,
    pub dishes: Vec<String>,
    pub tags: Vec<String>,
    pub source_url: String,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub original_price: Option<i64>,
    pub order_deadline: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub fulfill_start: Option<String>,
    #[serde(default)]
    pub shipping: ShippingModes,
}

impl Listing {
    /// Reject records that cannot participate in consolidation.
    pub fn validate(&self) -> Result<(), ListingError> {
        if self.vendor_name.trim().is_empty() {
            return Err(ListingError::MissingVendor);
        }
        if self.title.trim().is_empty() {
            return Err(ListingError::MissingTitle);
        }
        if self.price <= 0 {
            return Err(ListingError::NonPositivePrice(self.price));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListingError {
    #[error("缺少店家名稱")]
    MissingVendor,
    #[error("缺少商品名稱")]
    MissingTitle,
    #[error("價格必須為正數: {0}")]
    NonPositivePrice(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Published,
    Duplicate,
}

/// Persisted catalog entry. Entries are never deleted; losing a conflict
/// resolution marks them [`EntryStatus::Duplicate`] and keeps them for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub status: EntryStatus,
    /// Weak back-reference to the winning entry; id lookup only.
    pub duplicate_of: Option<Uuid>,
    pub duplicate_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub listing: Listing,
}

impl CatalogEntry {
    pub fn publish(listing: Listing, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: EntryStatus::Published,
            duplicate_of: None,
            duplicate_reason: None,
            created_at: now,
            updated_at: now,
            listing,
        }
    }

    pub fn is_published(&self) -> bool {
        self.status == EntryStatus::Published
    }

    /// Non-destructive deprecation in favor of `winner`.
    pub fn supersede(&mut self, winner: Uuid, reason: String, now: DateTime<Utc>) {
        self.status = EntryStatus::Duplicate;
        self.duplicate_of = Some(winner);
        self.duplicate_reason = Some(reason);
        self.updated_at = now;
    }
}
