//! PostgreSQL store implementation.
//!
//! Constraint enforcement lives in the schema: the unique
//! `(phone_number, category_id)` pair, the `ON DELETE RESTRICT` foreign key
//! from contacts to categories, and the status guard in `persist_message`'s
//! `WHERE` clause. Violations surface as typed [`StoreError`] variants via
//! the `From<sqlx::Error>` mapping.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::phone::E164;
use crate::types::{
    ActivityLogEntry, AuditAction, Category, CategoryId, Contact, ContactId, DeliveryStatus,
    MessageId, MessageRecord, NewContact, UserId,
};

use super::{Result, Store, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    created_by UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS contacts (
    id UUID PRIMARY KEY,
    phone_number TEXT NOT NULL,
    category_id UUID NOT NULL REFERENCES categories(id) ON DELETE RESTRICT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT contacts_phone_number_category_id_key UNIQUE (phone_number, category_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    sent_by UUID NOT NULL,
    recipient TEXT NOT NULL,
    body TEXT NOT NULL,
    status TEXT NOT NULL,
    category_id UUID,
    provider_message_id TEXT,
    sent_at TIMESTAMPTZ NOT NULL,
    delivered_at TIMESTAMPTZ,
    failed_at TIMESTAMPTZ,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS messages_provider_message_id_idx
    ON messages (provider_message_id);

CREATE TABLE IF NOT EXISTS activity_log (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL,
    action TEXT NOT NULL,
    details TEXT,
    ip_address TEXT,
    user_agent TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they don't exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn contact_from_row(row: &PgRow) -> Result<Contact> {
    Ok(Contact {
        id: row.try_get("id").map_err(StoreError::from)?,
        phone_number: E164::from_trusted(
            row.try_get::<String, _>("phone_number")
                .map_err(StoreError::from)?,
        ),
        category_id: row.try_get("category_id").map_err(StoreError::from)?,
        created_at: row.try_get("created_at").map_err(StoreError::from)?,
    })
}

fn category_from_row(row: &PgRow) -> Result<Category> {
    Ok(Category {
        id: row.try_get("id").map_err(StoreError::from)?,
        name: row.try_get("name").map_err(StoreError::from)?,
        created_by: row.try_get("created_by").map_err(StoreError::from)?,
        created_at: row.try_get("created_at").map_err(StoreError::from)?,
    })
}

fn message_from_row(row: &PgRow) -> Result<MessageRecord> {
    let status: String = row.try_get("status").map_err(StoreError::from)?;
    Ok(MessageRecord {
        id: row.try_get("id").map_err(StoreError::from)?,
        sent_by: row.try_get("sent_by").map_err(StoreError::from)?,
        recipient: E164::from_trusted(
            row.try_get::<String, _>("recipient")
                .map_err(StoreError::from)?,
        ),
        body: row.try_get("body").map_err(StoreError::from)?,
        status: DeliveryStatus::from_str(&status).map_err(anyhow::Error::msg)?,
        category_id: row.try_get("category_id").map_err(StoreError::from)?,
        provider_message_id: row
            .try_get("provider_message_id")
            .map_err(StoreError::from)?,
        sent_at: row.try_get("sent_at").map_err(StoreError::from)?,
        delivered_at: row.try_get("delivered_at").map_err(StoreError::from)?,
        failed_at: row.try_get("failed_at").map_err(StoreError::from)?,
        error_message: row.try_get("error_message").map_err(StoreError::from)?,
    })
}

fn activity_from_row(row: &PgRow) -> Result<ActivityLogEntry> {
    let action: String = row.try_get("action").map_err(StoreError::from)?;
    Ok(ActivityLogEntry {
        id: row.try_get("id").map_err(StoreError::from)?,
        user_id: row.try_get("user_id").map_err(StoreError::from)?,
        action: AuditAction::from_str(&action).map_err(anyhow::Error::msg)?,
        details: row.try_get("details").map_err(StoreError::from)?,
        ip_address: row.try_get("ip_address").map_err(StoreError::from)?,
        user_agent: row.try_get("user_agent").map_err(StoreError::from)?,
        created_at: row.try_get("created_at").map_err(StoreError::from)?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_contact(&self, new: NewContact) -> Result<Contact> {
        let row = sqlx::query(
            "INSERT INTO contacts (id, phone_number, category_id)
             VALUES ($1, $2, $3)
             RETURNING id, phone_number, category_id, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(new.phone_number.as_str())
        .bind(new.category_id)
        .fetch_one(&self.pool)
        .await?;
        contact_from_row(&row)
    }

    async fn create_contacts_skip_duplicates(&self, rows: Vec<NewContact>) -> Result<u32> {
        // One transaction so a bulk import is all-or-nothing on store failure.
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u32;
        for new in rows {
            let result = sqlx::query(
                "INSERT INTO contacts (id, phone_number, category_id)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (phone_number, category_id) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(new.phone_number.as_str())
            .bind(new.category_id)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as u32;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update_contact(&self, id: ContactId, new: NewContact) -> Result<Contact> {
        let row = sqlx::query(
            "UPDATE contacts SET phone_number = $2, category_id = $3
             WHERE id = $1
             RETURNING id, phone_number, category_id, created_at",
        )
        .bind(id)
        .bind(new.phone_number.as_str())
        .bind(new.category_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        contact_from_row(&row)
    }

    async fn delete_contact(&self, id: ContactId) -> Result<()> {
        let result = sqlx::query("DELETE FROM contacts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get_contact(&self, id: ContactId) -> Result<Contact> {
        let row = sqlx::query(
            "SELECT id, phone_number, category_id, created_at FROM contacts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        contact_from_row(&row)
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            "SELECT id, phone_number, category_id, created_at FROM contacts
             ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(contact_from_row).collect()
    }

    async fn list_contacts_in_category(&self, category_id: CategoryId) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            "SELECT id, phone_number, category_id, created_at FROM contacts
             WHERE category_id = $1
             ORDER BY created_at, id",
        )
        .bind(category_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(contact_from_row).collect()
    }

    async fn get_contacts(&self, ids: &[ContactId]) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            "SELECT id, phone_number, category_id, created_at FROM contacts
             WHERE id = ANY($1)
             ORDER BY created_at, id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(contact_from_row).collect()
    }

    async fn create_category(&self, name: &str, created_by: UserId) -> Result<Category> {
        let row = sqlx::query(
            "INSERT INTO categories (id, name, created_by)
             VALUES ($1, $2, $3)
             RETURNING id, name, created_by, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await?;
        category_from_row(&row)
    }

    async fn get_category(&self, id: CategoryId) -> Result<Category> {
        let row =
            sqlx::query("SELECT id, name, created_by, created_at FROM categories WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(StoreError::NotFound)?;
        category_from_row(&row)
    }

    async fn delete_category(&self, id: CategoryId) -> Result<()> {
        // ON DELETE RESTRICT raises a foreign key violation when contacts
        // still reference the category.
        let result = sqlx::query("DELETE FROM categories WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_message(&self, record: MessageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages
                 (id, sent_by, recipient, body, status, category_id,
                  provider_message_id, sent_at, delivered_at, failed_at, error_message)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.id)
        .bind(record.sent_by)
        .bind(record.recipient.as_str())
        .bind(&record.body)
        .bind(record.status.as_str())
        .bind(record.category_id)
        .bind(&record.provider_message_id)
        .bind(record.sent_at)
        .bind(record.delivered_at)
        .bind(record.failed_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<MessageRecord> {
        let row = sqlx::query(
            "SELECT id, sent_by, recipient, body, status, category_id,
                    provider_message_id, sent_at, delivered_at, failed_at, error_message
             FROM messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        message_from_row(&row)
    }

    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> Result<MessageRecord> {
        let row = sqlx::query(
            "SELECT id, sent_by, recipient, body, status, category_id,
                    provider_message_id, sent_at, delivered_at, failed_at, error_message
             FROM messages WHERE provider_message_id = $1",
        )
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        message_from_row(&row)
    }

    async fn persist_message(&self, record: &MessageRecord) -> Result<()> {
        // The status guard makes the update atomic at record level: a record
        // that reached a terminal status is never overwritten.
        let result = sqlx::query(
            "UPDATE messages
             SET status = $2, provider_message_id = $3, delivered_at = $4,
                 failed_at = $5, error_message = $6
             WHERE id = $1 AND status IN ('pending', 'sent')",
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(&record.provider_message_id)
        .bind(record.delivered_at)
        .bind(record.failed_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "gone" from "already terminal".
            self.get_message(record.id).await?;
            return Err(StoreError::TerminalStatus);
        }
        Ok(())
    }

    async fn append_activity(&self, entry: ActivityLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity_log
                 (id, user_id, action, details, ip_address, user_agent, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(&entry.details)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_activity(&self) -> Result<Vec<ActivityLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, user_id, action, details, ip_address, user_agent, created_at
             FROM activity_log ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }
}
