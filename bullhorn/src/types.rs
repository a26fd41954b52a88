//! Core domain types for the dispatch engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phone::E164;

pub type ContactId = Uuid;
pub type CategoryId = Uuid;
pub type UserId = Uuid;
pub type MessageId = Uuid;

/// Role of an authenticated caller, as asserted by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            _ => Err(()),
        }
    }
}

/// Authenticated caller identity.
///
/// Produced once at the request boundary from the identity layer's assertion
/// and passed explicitly into every mutating operation. The engine never
/// re-derives identity from ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

/// Per-request metadata carried into the activity log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Which contacts a dispatch targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipientSelection {
    /// Every contact in the store.
    All,
    /// Every contact in one category.
    Category { id: CategoryId },
    /// Exactly the listed contacts.
    Explicit { ids: Vec<ContactId> },
}

impl RecipientSelection {
    /// Human-readable descriptor, used in activity log details.
    pub fn describe(&self) -> String {
        match self {
            RecipientSelection::All => "all contacts".to_string(),
            RecipientSelection::Category { id } => format!("category {id}"),
            RecipientSelection::Explicit { ids } => format!("{} selected contact(s)", ids.len()),
        }
    }
}

/// One addressable recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub phone_number: E164,
    pub category_id: CategoryId,
    pub created_at: DateTime<Utc>,
}

/// Contact data for insert/update. The `(phone_number, category_id)` pair is
/// unique; the store rejects or skips duplicates, never silently doubles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub phone_number: E164,
    pub category_id: CategoryId,
}

/// A named grouping of contacts, owned by the user who created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Delivery lifecycle of one message.
///
/// `Pending -> Sent -> {Delivered, Failed, Bounced}`, with `Pending -> Failed`
/// when the provider rejects the send synchronously. `Delivered`, `Failed`
/// and `Bounced` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Bounced,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Bounced
        )
    }

    /// Whether a callback may move a record from `self` to `next`.
    ///
    /// Terminal statuses never transition; a `Sent -> Sent` re-delivery is
    /// allowed (and a no-op) because providers retry callbacks.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        match self {
            DeliveryStatus::Pending => {
                matches!(next, DeliveryStatus::Sent | DeliveryStatus::Failed)
            }
            DeliveryStatus::Sent => matches!(
                next,
                DeliveryStatus::Sent
                    | DeliveryStatus::Delivered
                    | DeliveryStatus::Failed
                    | DeliveryStatus::Bounced
            ),
            DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::Bounced => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Bounced => "bounced",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "bounced" => Ok(DeliveryStatus::Bounced),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// One row per (dispatch, recipient): the permanent record of what was sent.
///
/// Created by the dispatcher at send time; only the reconciler mutates it
/// afterwards; never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sent_by: UserId,
    pub recipient: E164,
    pub body: String,
    pub status: DeliveryStatus,
    pub category_id: Option<CategoryId>,
    pub provider_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Action code for an activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    SendSms,
    CreateContact,
    UpdateContact,
    DeleteContact,
    BulkImportContacts,
    CreateCategory,
    DeleteCategory,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SendSms => "SEND_SMS",
            AuditAction::CreateContact => "CREATE_CONTACT",
            AuditAction::UpdateContact => "UPDATE_CONTACT",
            AuditAction::DeleteContact => "DELETE_CONTACT",
            AuditAction::BulkImportContacts => "BULK_IMPORT_CONTACTS",
            AuditAction::CreateCategory => "CREATE_CATEGORY",
            AuditAction::DeleteCategory => "DELETE_CATEGORY",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEND_SMS" => Ok(AuditAction::SendSms),
            "CREATE_CONTACT" => Ok(AuditAction::CreateContact),
            "UPDATE_CONTACT" => Ok(AuditAction::UpdateContact),
            "DELETE_CONTACT" => Ok(AuditAction::DeleteContact),
            "BULK_IMPORT_CONTACTS" => Ok(AuditAction::BulkImportContacts),
            "CREATE_CATEGORY" => Ok(AuditAction::CreateCategory),
            "DELETE_CATEGORY" => Ok(AuditAction::DeleteCategory),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

/// Append-only record of a mutating user action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub action: AuditAction,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One resolved dispatch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub contact_id: ContactId,
    pub phone_number: E164,
}

/// One "send" operation, transient: resolved into individual message records
/// and then discarded.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub actor: Actor,
    pub body: String,
    pub selection: RecipientSelection,
    pub meta: RequestMeta,
}

/// Outcome of one recipient within a dispatch. `status` is either `Sent` or
/// `Failed` here; later delivery callbacks do not update past results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientOutcome {
    pub contact_id: ContactId,
    pub recipient: E164,
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

/// Aggregate result of one dispatch.
///
/// `sent_count + failed_count` equals the number of resolved recipients
/// unless the dispatch was cooperatively stopped, in which case
/// `skipped_count` holds the recipients that were never attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub sent_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub outcomes: Vec<RecipientOutcome>,
}

/// Status reported by the provider's delivery webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Sent,
    Delivered,
    Failed,
    Bounced,
}

impl From<CallbackStatus> for DeliveryStatus {
    fn from(status: CallbackStatus) -> Self {
        match status {
            CallbackStatus::Sent => DeliveryStatus::Sent,
            CallbackStatus::Delivered => DeliveryStatus::Delivered,
            CallbackStatus::Failed => DeliveryStatus::Failed,
            CallbackStatus::Bounced => DeliveryStatus::Bounced,
        }
    }
}

/// Inbound delivery-status event pushed by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCallback {
    pub provider_message_id: String,
    pub status: CallbackStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

/// Emitted as each recipient's record is written during a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchUpdate {
    pub message_id: MessageId,
    pub recipient: E164,
    pub status: DeliveryStatus,
}
