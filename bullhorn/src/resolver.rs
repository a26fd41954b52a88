//! Recipient resolution: selection descriptor -> deduplicated, ordered set of
//! destination numbers.
//!
//! Resolution is read-only and stable: contacts come back in creation order
//! and deduplication keeps the first occurrence of each phone number, so
//! retrying a dispatch resolves the same set in the same order.

use std::collections::HashSet;

use crate::error::{EngineError, Result};
use crate::store::{Store, StoreError};
use crate::types::{Contact, ContactId, Recipient, RecipientSelection};

/// Resolve a selection into dispatch targets.
///
/// `Explicit` selections are all-or-nothing: if any listed ID is missing the
/// whole job is rejected with [`EngineError::PartialResolution`] carrying the
/// unresolvable IDs, so nothing is ever sent to a half-resolved list.
pub async fn resolve(store: &dyn Store, selection: &RecipientSelection) -> Result<Vec<Recipient>> {
    let contacts = match selection {
        RecipientSelection::All => store.list_contacts().await?,
        RecipientSelection::Category { id } => {
            match store.get_category(*id).await {
                Ok(_) => {}
                Err(StoreError::NotFound) => return Err(EngineError::CategoryNotFound(*id)),
                Err(e) => return Err(e.into()),
            }
            store.list_contacts_in_category(*id).await?
        }
        RecipientSelection::Explicit { ids } => {
            let found = store.get_contacts(ids).await?;
            let found_ids: HashSet<ContactId> = found.iter().map(|c| c.id).collect();

            let mut missing: Vec<ContactId> = Vec::new();
            let mut reported: HashSet<ContactId> = HashSet::new();
            for id in ids {
                if !found_ids.contains(id) && reported.insert(*id) {
                    missing.push(*id);
                }
            }
            if !missing.is_empty() {
                return Err(EngineError::PartialResolution { missing });
            }
            found
        }
    };

    Ok(dedup_by_phone(contacts))
}

/// First occurrence of each phone number wins. Stored numbers are already
/// normalized, so equality on the E.164 string is enough.
fn dedup_by_phone(contacts: Vec<Contact>) -> Vec<Recipient> {
    let mut seen: HashSet<String> = HashSet::with_capacity(contacts.len());
    contacts
        .into_iter()
        .filter(|c| seen.insert(c.phone_number.as_str().to_string()))
        .map(|c| Recipient {
            contact_id: c.id,
            phone_number: c.phone_number,
        })
        .collect()
}
