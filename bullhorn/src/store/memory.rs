//! In-memory store implementation.
//!
//! Backs tests and single-process deployments without a database. Everything
//! is lost on restart. Message records get entry-level locking through the
//! concurrent map, matching the record-level transaction scope the reconciler
//! relies on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::{
    ActivityLogEntry, Category, CategoryId, Contact, ContactId, MessageId, MessageRecord,
    NewContact, UserId,
};

use super::{Result, Store, StoreError};

#[derive(Clone, Default)]
pub struct InMemoryStore {
    contacts: Arc<RwLock<HashMap<ContactId, Contact>>>,
    /// Insertion order of contact IDs, so listings are reproducible.
    contact_order: Arc<RwLock<Vec<ContactId>>>,
    categories: Arc<RwLock<HashMap<CategoryId, Category>>>,
    messages: Arc<DashMap<MessageId, MessageRecord>>,
    provider_index: Arc<DashMap<String, MessageId>>,
    activity: Arc<RwLock<Vec<ActivityLogEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing_category(
        categories: &HashMap<CategoryId, Category>,
        id: CategoryId,
    ) -> Option<StoreError> {
        if categories.contains_key(&id) {
            None
        } else {
            Some(StoreError::ForeignKeyViolation {
                constraint: Some("contacts_category_id_fkey".to_string()),
                message: format!("category {id} does not exist"),
            })
        }
    }

    fn pair_exists(
        contacts: &HashMap<ContactId, Contact>,
        new: &NewContact,
        exclude: Option<ContactId>,
    ) -> bool {
        contacts.values().any(|c| {
            Some(c.id) != exclude
                && c.phone_number == new.phone_number
                && c.category_id == new.category_id
        })
    }

    fn ordered_contacts<F>(&self, mut filter: F) -> Vec<Contact>
    where
        F: FnMut(&Contact) -> bool,
    {
        let contacts = self.contacts.read();
        let order = self.contact_order.read();
        order
            .iter()
            .filter_map(|id| contacts.get(id))
            .filter(|c| filter(c))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_contact(&self, new: NewContact) -> Result<Contact> {
        // Lock order: categories before contacts, same as delete_category.
        // Holding the read lock also keeps a concurrent category delete from
        // racing past the reference check.
        let categories = self.categories.read();
        if let Some(err) = Self::missing_category(&categories, new.category_id) {
            return Err(err);
        }
        let mut contacts = self.contacts.write();

        if Self::pair_exists(&contacts, &new, None) {
            return Err(StoreError::UniqueViolation {
                constraint: Some("contacts_phone_number_category_id_key".to_string()),
                message: format!(
                    "contact {} already exists in category {}",
                    new.phone_number, new.category_id
                ),
            });
        }

        let contact = Contact {
            id: Uuid::new_v4(),
            phone_number: new.phone_number,
            category_id: new.category_id,
            created_at: Utc::now(),
        };
        contacts.insert(contact.id, contact.clone());
        self.contact_order.write().push(contact.id);
        Ok(contact)
    }

    async fn create_contacts_skip_duplicates(&self, rows: Vec<NewContact>) -> Result<u32> {
        let categories = self.categories.read();
        // Checked up front so the batch is all-or-nothing, matching the
        // transactional Postgres implementation.
        for new in &rows {
            if let Some(err) = Self::missing_category(&categories, new.category_id) {
                return Err(err);
            }
        }
        let mut contacts = self.contacts.write();
        let mut order = self.contact_order.write();

        let mut seen: HashSet<(String, CategoryId)> = contacts
            .values()
            .map(|c| (c.phone_number.as_str().to_string(), c.category_id))
            .collect();

        let mut inserted = 0u32;
        for new in rows {
            let key = (new.phone_number.as_str().to_string(), new.category_id);
            if !seen.insert(key) {
                continue;
            }
            let contact = Contact {
                id: Uuid::new_v4(),
                phone_number: new.phone_number,
                category_id: new.category_id,
                created_at: Utc::now(),
            };
            order.push(contact.id);
            contacts.insert(contact.id, contact);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn update_contact(&self, id: ContactId, new: NewContact) -> Result<Contact> {
        let categories = self.categories.read();
        if let Some(err) = Self::missing_category(&categories, new.category_id) {
            return Err(err);
        }
        let mut contacts = self.contacts.write();

        if !contacts.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        if Self::pair_exists(&contacts, &new, Some(id)) {
            return Err(StoreError::UniqueViolation {
                constraint: Some("contacts_phone_number_category_id_key".to_string()),
                message: format!(
                    "contact {} already exists in category {}",
                    new.phone_number, new.category_id
                ),
            });
        }

        let contact = contacts.get_mut(&id).ok_or(StoreError::NotFound)?;
        contact.phone_number = new.phone_number;
        contact.category_id = new.category_id;
        Ok(contact.clone())
    }

    async fn delete_contact(&self, id: ContactId) -> Result<()> {
        let removed = self.contacts.write().remove(&id);
        if removed.is_none() {
            return Err(StoreError::NotFound);
        }
        self.contact_order.write().retain(|c| *c != id);
        Ok(())
    }

    async fn get_contact(&self, id: ContactId) -> Result<Contact> {
        self.contacts
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        Ok(self.ordered_contacts(|_| true))
    }

    async fn list_contacts_in_category(&self, category_id: CategoryId) -> Result<Vec<Contact>> {
        Ok(self.ordered_contacts(|c| c.category_id == category_id))
    }

    async fn get_contacts(&self, ids: &[ContactId]) -> Result<Vec<Contact>> {
        let wanted: HashSet<ContactId> = ids.iter().copied().collect();
        Ok(self.ordered_contacts(|c| wanted.contains(&c.id)))
    }

    async fn create_category(&self, name: &str, created_by: UserId) -> Result<Category> {
        let category = Category {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_by,
            created_at: Utc::now(),
        };
        self.categories
            .write()
            .insert(category.id, category.clone());
        Ok(category)
    }

    async fn get_category(&self, id: CategoryId) -> Result<Category> {
        self.categories
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete_category(&self, id: CategoryId) -> Result<()> {
        // Lock order: categories before contacts, same as everywhere else.
        let mut categories = self.categories.write();
        if !categories.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        let in_use = self
            .contacts
            .read()
            .values()
            .any(|c| c.category_id == id);
        if in_use {
            return Err(StoreError::ForeignKeyViolation {
                constraint: Some("contacts_category_id_fkey".to_string()),
                message: format!("category {id} still has contacts"),
            });
        }
        categories.remove(&id);
        Ok(())
    }

    async fn insert_message(&self, record: MessageRecord) -> Result<()> {
        if let Some(provider_id) = &record.provider_message_id {
            self.provider_index.insert(provider_id.clone(), record.id);
        }
        self.messages.insert(record.id, record);
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<MessageRecord> {
        self.messages
            .get(&id)
            .map(|r| r.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<MessageRecord> {
        let id = self
            .provider_index
            .get(provider_message_id)
            .map(|entry| *entry)
            .ok_or(StoreError::NotFound)?;
        self.get_message(id).await
    }

    async fn persist_message(&self, record: &MessageRecord) -> Result<()> {
        // get_mut holds the shard lock across check and write, so concurrent
        // callbacks for the same record serialize here.
        let mut existing = self.messages.get_mut(&record.id).ok_or(StoreError::NotFound)?;
        if existing.status.is_terminal() {
            return Err(StoreError::TerminalStatus);
        }
        *existing = record.clone();
        Ok(())
    }

    async fn append_activity(&self, entry: ActivityLogEntry) -> Result<()> {
        self.activity.write().push(entry);
        Ok(())
    }

    async fn list_activity(&self) -> Result<Vec<ActivityLogEntry>> {
        Ok(self.activity.read().clone())
    }
}
