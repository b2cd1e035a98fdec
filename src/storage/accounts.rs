use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::db::Db;

/// Persisted ACME account, keyed by contact email and directory URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAccount {
    pub account_id: String,
    /// Serialized `instant_acme::AccountCredentials`, including the account key.
    pub credentials_json: String,
}

#[derive(Clone)]
pub struct AccountStore {
    db: Db,
}

impl AccountStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn find(&self, contact_email: &str, directory_url: &str) -> Result<Option<StoredAccount>> {
        let conn = self.db.lock_conn()?;
        let account = conn
            .query_row(
                "SELECT account_id, credentials_json FROM acme_accounts \
                 WHERE contact_email = ?1 AND directory_url = ?2",
                params![contact_email, directory_url],
                |row| {
                    Ok(StoredAccount {
                        account_id: row.get(0)?,
                        credentials_json: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("failed to load ACME account")?;
        Ok(account)
    }

    pub fn save(
        &self,
        contact_email: &str,
        directory_url: &str,
        account: &StoredAccount,
    ) -> Result<()> {
        let conn = self.db.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO acme_accounts (contact_email, directory_url, account_id, credentials_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(contact_email, directory_url) DO UPDATE SET
                account_id = excluded.account_id,
                credentials_json = excluded.credentials_json
            "#,
            params![
                contact_email,
                directory_url,
                account.account_id,
                account.credentials_json,
                Utc::now().to_rfc3339()
            ],
        )
        .context("failed to save ACME account")?;
        Ok(())
    }
}
