//! Synchronized entities and their pending-change tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of local change awaiting upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Record created locally, never sent.
    Create,
    /// Existing record modified.
    Update,
    /// Record soft-deleted locally.
    Delete,
}

/// The three synchronized entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Service,
    Credential,
    Subscription,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Service => "service",
            EntityKind::Credential => "credential",
            EntityKind::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing period of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

/// Common surface of every synchronized record.
pub trait SyncRecord: Clone + Send + Sync + 'static {
    /// Which entity kind this is.
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Pending change tag; `None` means synchronized.
    fn pending_sync(&self) -> Option<ChangeType>;

    fn set_pending_sync(&mut self, change: Option<ChangeType>);

    fn updated_at(&self) -> DateTime<Utc>;

    fn set_updated_at(&mut self, at: DateTime<Utc>);

    fn last_synced_at(&self) -> Option<DateTime<Utc>>;

    fn set_last_synced_at(&mut self, at: Option<DateTime<Utc>>);

    /// Clear the tag after the server accepted this version.
    fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.set_pending_sync(None);
        self.set_last_synced_at(Some(at));
    }

    /// Note a local edit. An unsent creation stays a creation.
    fn record_update(&mut self, now: DateTime<Utc>) {
        self.set_updated_at(now);
        if self.pending_sync() != Some(ChangeType::Create) {
            self.set_pending_sync(Some(ChangeType::Update));
        }
    }

    /// Soft-delete the record until the server acknowledges it.
    fn record_delete(&mut self, now: DateTime<Utc>) {
        self.set_updated_at(now);
        self.set_pending_sync(Some(ChangeType::Delete));
    }
}

macro_rules! impl_sync_record {
    ($ty:ty, $kind:expr) => {
        impl SyncRecord for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn pending_sync(&self) -> Option<ChangeType> {
                self.pending_sync
            }

            fn set_pending_sync(&mut self, change: Option<ChangeType>) {
                self.pending_sync = change;
            }

            fn updated_at(&self) -> DateTime<Utc> {
                self.updated_at
            }

            fn set_updated_at(&mut self, at: DateTime<Utc>) {
                self.updated_at = at;
            }

            fn last_synced_at(&self) -> Option<DateTime<Utc>> {
                self.last_synced_at
            }

            fn set_last_synced_at(&mut self, at: Option<DateTime<Utc>>) {
                self.last_synced_at = at;
            }
        }
    };
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A service (website, app) the user keeps credentials for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pending_sync: Option<ChangeType>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Service {
    /// Create a service pending upload.
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            user_id: user_id.into(),
            name: name.into(),
            url: None,
            notes: None,
            created_at: now,
            updated_at: now,
            pending_sync: Some(ChangeType::Create),
            last_synced_at: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

impl_sync_record!(Service, EntityKind::Service);

/// An encrypted secret belonging to a service.
///
/// `encrypted_data` and `iv` are base64; the plaintext never reaches this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub service_id: String,
    pub label: String,
    pub encrypted_data: String,
    pub iv: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pending_sync: Option<ChangeType>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Create a credential pending upload.
    pub fn new(
        service_id: impl Into<String>,
        label: impl Into<String>,
        encrypted_data: impl Into<String>,
        iv: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            service_id: service_id.into(),
            label: label.into(),
            encrypted_data: encrypted_data.into(),
            iv: iv.into(),
            created_at: now,
            updated_at: now,
            pending_sync: Some(ChangeType::Create),
            last_synced_at: None,
        }
    }
}

impl_sync_record!(Credential, EntityKind::Credential);

/// A recurring payment attached to a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub service_id: String,
    pub plan: String,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    #[serde(default)]
    pub next_renewal: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pending_sync: Option<ChangeType>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Create a subscription pending upload.
    pub fn new(
        service_id: impl Into<String>,
        plan: impl Into<String>,
        amount_cents: i64,
        currency: impl Into<String>,
        billing_cycle: BillingCycle,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            service_id: service_id.into(),
            plan: plan.into(),
            amount_cents,
            currency: currency.into(),
            billing_cycle,
            next_renewal: None,
            created_at: now,
            updated_at: now,
            pending_sync: Some(ChangeType::Create),
            last_synced_at: None,
        }
    }
}

impl_sync_record!(Subscription, EntityKind::Subscription);
