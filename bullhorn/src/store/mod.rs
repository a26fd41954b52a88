//! Persistence abstraction for contacts, categories, message records and the
//! activity log.
//!
//! The engine holds no long-lived in-memory state: every dispatch or
//! reconciliation re-derives what it needs through this trait. Implementations
//! surface constraint violations as typed [`StoreError`] variants so the
//! engine can branch on a closed set of kinds.

use async_trait::async_trait;

use crate::types::{
    ActivityLogEntry, Category, CategoryId, Contact, ContactId, MessageId, MessageRecord,
    NewContact, UserId,
};

mod error;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    /// Insert one contact.
    ///
    /// # Errors
    /// - `UniqueViolation` if the `(phone_number, category_id)` pair exists
    async fn create_contact(&self, new: NewContact) -> Result<Contact>;

    /// Bulk insert, silently skipping rows whose `(phone_number, category_id)`
    /// pair already exists (including duplicates within `rows` itself).
    /// Returns the number of rows actually inserted.
    async fn create_contacts_skip_duplicates(&self, rows: Vec<NewContact>) -> Result<u32>;

    /// Replace a contact's phone number and category.
    ///
    /// # Errors
    /// - `NotFound` if the contact doesn't exist
    /// - `UniqueViolation` if the new pair collides with another contact
    async fn update_contact(&self, id: ContactId, new: NewContact) -> Result<Contact>;

    /// Delete a contact. Historical message records are untouched.
    async fn delete_contact(&self, id: ContactId) -> Result<()>;

    async fn get_contact(&self, id: ContactId) -> Result<Contact>;

    /// All contacts, ordered by creation time so resolution is reproducible.
    async fn list_contacts(&self) -> Result<Vec<Contact>>;

    /// Contacts in one category, ordered by creation time.
    async fn list_contacts_in_category(&self, category_id: CategoryId) -> Result<Vec<Contact>>;

    /// The subset of `ids` that exist, ordered by creation time. Missing IDs
    /// are simply absent from the result; the caller decides whether that is
    /// an error.
    async fn get_contacts(&self, ids: &[ContactId]) -> Result<Vec<Contact>>;

    // ------------------------------------------------------------------
    // Categories
    // ------------------------------------------------------------------

    async fn create_category(&self, name: &str, created_by: UserId) -> Result<Category>;

    async fn get_category(&self, id: CategoryId) -> Result<Category>;

    /// Delete a category.
    ///
    /// # Errors
    /// - `NotFound` if the category doesn't exist
    /// - `ForeignKeyViolation` if contacts still reference it -- contacts are
    ///   never implicitly deleted with their category
    async fn delete_category(&self, id: CategoryId) -> Result<()>;

    // ------------------------------------------------------------------
    // Message records
    // ------------------------------------------------------------------

    /// Insert a freshly created message record.
    async fn insert_message(&self, record: MessageRecord) -> Result<()>;

    async fn get_message(&self, id: MessageId) -> Result<MessageRecord>;

    /// Look up the record a provider callback refers to.
    ///
    /// # Errors
    /// - `NotFound` for unknown/stale provider message IDs
    async fn find_message_by_provider_id(&self, provider_message_id: &str)
        -> Result<MessageRecord>;

    /// Persist an updated message record, keyed by `record.id`.
    ///
    /// Refuses to overwrite a record whose stored status is already terminal,
    /// so concurrent or out-of-order callbacks cannot regress a terminal
    /// status.
    ///
    /// # Errors
    /// - `NotFound` if the record doesn't exist
    /// - `TerminalStatus` if the stored record is already terminal
    async fn persist_message(&self, record: &MessageRecord) -> Result<()>;

    // ------------------------------------------------------------------
    // Activity log
    // ------------------------------------------------------------------

    /// Append one activity log entry. The log is append-only; entries are
    /// never mutated or deleted.
    async fn append_activity(&self, entry: ActivityLogEntry) -> Result<()>;

    /// All activity entries, oldest first.
    async fn list_activity(&self) -> Result<Vec<ActivityLogEntry>>;
}
