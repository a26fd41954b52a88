//! Bulk contact import pipeline.
//!
//! Accepts either structured rows or raw delimited text, normalizes every
//! phone number, and performs a skip-duplicates bulk insert. Rows that fail
//! normalization are collected and reported, never abort the batch.
//!
//! Known limitation of the text parser: cells are split on newlines then
//! commas with no support for embedded delimiters or multi-line quoted
//! fields. A single pair of surrounding quotes per cell is stripped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::audit::AuditRecorder;
use crate::error::Result;
use crate::phone::normalize;
use crate::store::Store;
use crate::types::{Actor, AuditAction, CategoryId, NewContact, RequestMeta};

/// One candidate contact, phone number still in raw form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRow {
    pub phone_number: String,
    pub category_id: CategoryId,
}

/// What happened to a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    /// Rows actually inserted.
    pub imported: u32,
    /// Rows whose `(phone_number, category_id)` pair already existed, either
    /// in the store or earlier in the same batch.
    pub skipped: u32,
    /// Raw inputs that did not normalize to a valid phone number.
    pub invalid: Vec<String>,
}

/// Split raw delimited text into trimmed cells: newlines first, then commas.
/// A single pair of surrounding double quotes per cell is removed.
pub fn parse_delimited(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cells = line
                .split(',')
                .map(|cell| {
                    let cell = cell.trim();
                    let cell = cell
                        .strip_prefix('"')
                        .and_then(|c| c.strip_suffix('"'))
                        .unwrap_or(cell);
                    cell.to_string()
                })
                .collect();
            Some(cells)
        })
        .collect()
}

/// Turn raw uploaded text into import rows targeting one category. Every
/// non-empty cell is treated as a phone number.
pub fn rows_from_delimited(text: &str, category_id: CategoryId) -> Vec<ImportRow> {
    parse_delimited(text)
        .into_iter()
        .flatten()
        .filter(|cell| !cell.is_empty())
        .map(|phone_number| ImportRow {
            phone_number,
            category_id,
        })
        .collect()
}

#[derive(Clone)]
pub struct Importer {
    store: Arc<dyn Store>,
    audit: AuditRecorder,
}

impl Importer {
    pub fn new(store: Arc<dyn Store>, audit: AuditRecorder) -> Self {
        Self { store, audit }
    }

    /// Import a batch of rows.
    ///
    /// Phone numbers are normalized up front; the insert itself skips any
    /// `(phone_number, category_id)` pair that already exists, so re-running
    /// the same import is harmless.
    #[instrument(skip_all, fields(actor = %actor.id, rows = rows.len()))]
    pub async fn import(
        &self,
        actor: Actor,
        rows: Vec<ImportRow>,
        meta: &RequestMeta,
    ) -> Result<ImportOutcome> {
        let mut invalid = Vec::new();
        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            match normalize(&row.phone_number) {
                Ok(phone_number) => candidates.push(NewContact {
                    phone_number,
                    category_id: row.category_id,
                }),
                Err(_) => invalid.push(row.phone_number),
            }
        }

        let attempted = candidates.len() as u32;
        let imported = self.store.create_contacts_skip_duplicates(candidates).await?;
        let skipped = attempted - imported;

        let details = format!(
            "Imported {imported} contact(s), skipped {skipped} duplicate(s), {} invalid",
            invalid.len()
        );
        self.audit
            .record(actor, AuditAction::BulkImportContacts, Some(details), meta)
            .await;

        info!(imported, skipped, invalid = invalid.len(), "bulk import finished");
        Ok(ImportOutcome {
            imported,
            skipped,
            invalid,
        })
    }
}
