use anyhow::{Context, Result};
use rusqlite::Connection;

/// Runs all schema creation and migrations for the CertPilot database.
pub fn run_all(conn: &Connection) -> Result<()> {
    create_tables(conn)?;
    migrate_tables(conn)?;
    create_indexes(conn)?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS certificate_requests (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            domain TEXT NOT NULL,
            contact_email TEXT NOT NULL,
            status TEXT NOT NULL,
            order_handle TEXT,
            challenge_token TEXT,
            expected_digest TEXT,
            zone_id TEXT,
            zone_name TEXT,
            challenge_record TEXT,
            cert_path TEXT,
            key_path TEXT,
            chain_path TEXT,
            error_message TEXT,
            issue_date TEXT,
            expiry_date TEXT,
            install_date TEXT,
            install_warnings TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS acme_accounts (
            contact_email TEXT NOT NULL,
            directory_url TEXT NOT NULL,
            account_id TEXT NOT NULL,
            credentials_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (contact_email, directory_url)
        );
        "#,
    )?;
    Ok(())
}

fn migrate_tables(conn: &Connection) -> Result<()> {
    ensure_columns(conn, "certificate_requests", &[
        ("error_code", "ALTER TABLE certificate_requests ADD COLUMN error_code TEXT"),
        ("fingerprint", "ALTER TABLE certificate_requests ADD COLUMN fingerprint TEXT"),
        (
            "renewal_status",
            "ALTER TABLE certificate_requests \
             ADD COLUMN renewal_status TEXT NOT NULL DEFAULT 'not_scheduled'",
        ),
    ])?;
    Ok(())
}

fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_requests_tenant_domain
            ON certificate_requests (tenant_id, domain);

        -- At most one in-flight request per domain.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_active_domain
            ON certificate_requests (domain)
            WHERE status IN (
                'pending', 'dns_challenge_published', 'awaiting_propagation',
                'awaiting_ca_validation', 'finalizing'
            );
        "#,
    )?;
    Ok(())
}

fn ensure_columns(conn: &Connection, table: &str, alters: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to introspect table {table}"))?;
    let mut rows = stmt.query([])?;
    let mut existing = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        existing.push(name);
    }

    for (column, alter_sql) in alters {
        if !existing.iter().any(|c| c == column) {
            conn.execute(alter_sql, [])
                .with_context(|| format!("failed to apply migration for {table}.{column}"))?;
        }
    }

    Ok(())
}
