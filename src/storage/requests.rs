//! Certificate request registry.
//!
//! Persists [`CertificateRequest`] rows in SQLite and enforces the status
//! lifecycle: every status change goes through
//! [`RequestStatus::can_transition_to`] inside a transaction, so a request
//! can never move backwards or leave a terminal state.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Params, Row, params};
use uuid::Uuid;

use super::db::Db;
use crate::core::types::{
    CertificatePaths, CertificateRequest, ErrorCode, RenewalStatus, RequestStatus,
};

const COLUMNS: &str = "id, tenant_id, domain, contact_email, status, order_handle, \
    challenge_token, expected_digest, zone_id, zone_name, challenge_record, cert_path, \
    key_path, chain_path, error_code, error_message, issue_date, expiry_date, install_date, \
    install_warnings, fingerprint, created_at, updated_at, renewal_status";

const ACTIVE_FILTER: &str = "status IN ('pending', 'dns_challenge_published', \
    'awaiting_propagation', 'awaiting_ca_validation', 'finalizing')";

/// Challenge details kept so the TXT record can be removed later, even by
/// another process.
#[derive(Debug, Clone)]
pub struct ChallengeBookkeeping {
    pub token: String,
    pub digest: String,
    pub zone_id: String,
    pub zone_name: String,
    pub record_name: String,
}

/// Outcome of a successful issuance.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub paths: CertificatePaths,
    pub issue_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    pub fingerprint: String,
}

/// SQLite-backed store for certificate requests.
#[derive(Clone)]
pub struct RequestStore {
    db: Db,
}

impl RequestStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Inserts a new request in `pending`.
    ///
    /// # Errors
    /// Fails if another request for the same domain is still in flight; the
    /// partial unique index on `domain` rejects the insert.
    pub fn create(
        &self,
        tenant_id: &str,
        domain: &str,
        contact_email: &str,
    ) -> Result<CertificateRequest> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.db.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO certificate_requests (
                id, tenant_id, domain, contact_email, status, install_warnings, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?6)
            "#,
            params![
                id,
                tenant_id,
                domain,
                contact_email,
                RequestStatus::Pending.as_str(),
                now.to_rfc3339()
            ],
        )
        .with_context(|| format!("failed to create certificate request for {domain}"))?;
        info!("[store] created request {id} for {domain} (tenant {tenant_id})");
        fetch(&conn, &id)?.ok_or_else(|| anyhow!("request {id} vanished after insert"))
    }

    pub fn get(&self, id: &str) -> Result<Option<CertificateRequest>> {
        let conn = self.db.lock_conn()?;
        fetch(&conn, id)
    }

    pub fn require(&self, id: &str) -> Result<CertificateRequest> {
        self.get(id)?
            .ok_or_else(|| anyhow!("certificate request {id} not found"))
    }

    pub fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<CertificateRequest>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM certificate_requests WHERE tenant_id = ?1 \
                 ORDER BY created_at DESC"
            ),
            params![tenant_id],
        )
    }

    /// Returns the in-flight request for `domain`, if any.
    pub fn find_active(&self, domain: &str) -> Result<Option<CertificateRequest>> {
        let mut found = self.query(
            &format!(
                "SELECT {COLUMNS} FROM certificate_requests WHERE domain = ?1 AND {ACTIVE_FILTER}"
            ),
            params![domain],
        )?;
        Ok(found.pop())
    }

    pub fn list_active(&self) -> Result<Vec<CertificateRequest>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM certificate_requests WHERE {ACTIVE_FILTER} \
                 ORDER BY created_at"
            ),
            [],
        )
    }

    /// Issued or installed requests whose certificate expires at or before `now`.
    pub fn list_expiring(&self, now: DateTime<Utc>) -> Result<Vec<CertificateRequest>> {
        let candidates = self.query(
            &format!(
                "SELECT {COLUMNS} FROM certificate_requests \
                 WHERE status IN ('issued', 'installed') AND expiry_date IS NOT NULL"
            ),
            [],
        )?;
        Ok(candidates
            .into_iter()
            .filter(|request| request.expiry_date.is_some_and(|expiry| expiry <= now))
            .collect())
    }

    /// Issued or installed requests expiring at or before `cutoff`, soonest
    /// first. Skips certificates already being renewed and those superseded
    /// by a newer certificate for the same domain.
    pub fn list_renewal_due(&self, cutoff: DateTime<Utc>) -> Result<Vec<CertificateRequest>> {
        let certificates = self.query(
            &format!(
                "SELECT {COLUMNS} FROM certificate_requests \
                 WHERE status IN ('issued', 'installed') AND expiry_date IS NOT NULL"
            ),
            [],
        )?;
        let mut newest: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for request in &certificates {
            if let Some(issued) = request.issue_date {
                newest
                    .entry(request.domain.as_str())
                    .and_modify(|latest| *latest = (*latest).max(issued))
                    .or_insert(issued);
            }
        }
        let mut due: Vec<CertificateRequest> = certificates
            .iter()
            .filter(|request| {
                request.renewal_status != RenewalStatus::InProgress
                    && request.expiry_date.is_some_and(|expiry| expiry <= cutoff)
                    && request.issue_date.is_none_or(|issued| {
                        newest.get(request.domain.as_str()).is_none_or(|latest| issued >= *latest)
                    })
            })
            .cloned()
            .collect();
        due.sort_by_key(|request| request.expiry_date);
        Ok(due)
    }

    pub fn set_renewal_status(&self, id: &str, renewal: RenewalStatus) -> Result<CertificateRequest> {
        let conn = self.db.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE certificate_requests SET renewal_status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, renewal.as_str(), Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to set renewal status of request {id}"))?;
        if changed == 0 {
            return Err(anyhow!("certificate request {id} not found"));
        }
        debug!("[store] request {id}: renewal {renewal}");
        fetch(&conn, id)?.ok_or_else(|| anyhow!("certificate request {id} not found"))
    }

    /// Removes the row. Returns `false` when no request had this id.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.lock_conn()?;
        let removed = conn
            .execute("DELETE FROM certificate_requests WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete certificate request {id}"))?;
        if removed > 0 {
            info!("[store] deleted request {id}");
        }
        Ok(removed > 0)
    }

    pub fn transition(&self, id: &str, next: RequestStatus) -> Result<CertificateRequest> {
        self.checked_update(
            id,
            next,
            "UPDATE certificate_requests SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, next.as_str(), Utc::now().to_rfc3339()],
        )
    }

    pub fn record_order(&self, id: &str, order_handle: &str) -> Result<()> {
        let conn = self.db.lock_conn()?;
        conn.execute(
            "UPDATE certificate_requests SET order_handle = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, order_handle, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("failed to record order for request {id}"))?;
        Ok(())
    }

    pub fn record_challenge(&self, id: &str, challenge: &ChallengeBookkeeping) -> Result<()> {
        let conn = self.db.lock_conn()?;
        conn.execute(
            r#"
            UPDATE certificate_requests
            SET challenge_token = ?2, expected_digest = ?3, zone_id = ?4, zone_name = ?5,
                challenge_record = ?6, updated_at = ?7
            WHERE id = ?1
            "#,
            params![
                id,
                challenge.token,
                challenge.digest,
                challenge.zone_id,
                challenge.zone_name,
                challenge.record_name,
                Utc::now().to_rfc3339()
            ],
        )
        .with_context(|| format!("failed to record challenge for request {id}"))?;
        Ok(())
    }

    pub fn mark_issued(&self, id: &str, issued: &IssuedCertificate) -> Result<CertificateRequest> {
        self.checked_update(
            id,
            RequestStatus::Issued,
            r#"
            UPDATE certificate_requests
            SET status = ?2, cert_path = ?3, key_path = ?4, chain_path = ?5,
                issue_date = ?6, expiry_date = ?7, fingerprint = ?8,
                error_code = NULL, error_message = NULL, updated_at = ?9
            WHERE id = ?1
            "#,
            params![
                id,
                RequestStatus::Issued.as_str(),
                issued.paths.cert_path,
                issued.paths.key_path,
                issued.paths.chain_path,
                issued.issue_date.to_rfc3339(),
                issued.expiry_date.to_rfc3339(),
                issued.fingerprint,
                Utc::now().to_rfc3339()
            ],
        )
    }

    /// Moves an in-flight request to `error`, storing `"<Code>: <detail>"`.
    pub fn mark_error(&self, id: &str, code: ErrorCode, message: &str) -> Result<CertificateRequest> {
        self.checked_update(
            id,
            RequestStatus::Error,
            r#"
            UPDATE certificate_requests
            SET status = ?2, error_code = ?3, error_message = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                id,
                RequestStatus::Error.as_str(),
                code.as_str(),
                message,
                Utc::now().to_rfc3339()
            ],
        )
    }

    pub fn mark_installed(
        &self,
        id: &str,
        installed_at: DateTime<Utc>,
        warnings: &[String],
    ) -> Result<CertificateRequest> {
        let warnings_json =
            serde_json::to_string(warnings).context("failed to serialize install warnings")?;
        self.checked_update(
            id,
            RequestStatus::Installed,
            r#"
            UPDATE certificate_requests
            SET status = ?2, install_date = ?3, install_warnings = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                id,
                RequestStatus::Installed.as_str(),
                installed_at.to_rfc3339(),
                warnings_json,
                Utc::now().to_rfc3339()
            ],
        )
    }

    /// Stores warnings from a failed installation without changing status.
    pub fn record_install_warnings(&self, id: &str, warnings: &[String]) -> Result<CertificateRequest> {
        let warnings_json =
            serde_json::to_string(warnings).context("failed to serialize install warnings")?;
        let conn = self.db.lock_conn()?;
        conn.execute(
            "UPDATE certificate_requests SET install_warnings = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, warnings_json, Utc::now().to_rfc3339()],
        )?;
        fetch(&conn, id)?.ok_or_else(|| anyhow!("certificate request {id} not found"))
    }

    pub fn mark_expired(&self, id: &str) -> Result<CertificateRequest> {
        self.transition(id, RequestStatus::Expired)
    }

    fn query<P: Params>(&self, sql: &str, params: P) -> Result<Vec<CertificateRequest>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut requests = Vec::new();
        while let Some(row) = rows.next()? {
            requests.push(row_to_request(row)?);
        }
        Ok(requests)
    }

    fn checked_update<P: Params>(
        &self,
        id: &str,
        next: RequestStatus,
        sql: &str,
        params: P,
    ) -> Result<CertificateRequest> {
        let mut conn = self.db.lock_conn()?;
        let tx = conn.transaction()?;
        let current: String = tx
            .query_row(
                "SELECT status FROM certificate_requests WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("certificate request {id} not found"))?;
        let current: RequestStatus = current.parse()?;
        if !current.can_transition_to(next) {
            return Err(anyhow!(
                "invalid status transition for request {id}: {current} -> {next}"
            ));
        }
        tx.execute(sql, params)
            .with_context(|| format!("failed to move request {id} to {next}"))?;
        tx.commit()?;
        debug!("[store] request {id}: {current} -> {next}");
        fetch(&conn, id)?.ok_or_else(|| anyhow!("certificate request {id} not found"))
    }
}

fn fetch(conn: &Connection, id: &str) -> Result<Option<CertificateRequest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM certificate_requests WHERE id = ?1"
    ))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_request(row)?)),
        None => Ok(None),
    }
}

fn row_to_request(row: &Row<'_>) -> Result<CertificateRequest> {
    let status_raw: String = row.get(4)?;
    let error_code_raw: Option<String> = row.get(14)?;
    let warnings_raw: String = row.get(19)?;
    let created_raw: String = row.get(21)?;
    let updated_raw: String = row.get(22)?;
    let renewal_raw: String = row.get(23)?;

    Ok(CertificateRequest {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        domain: row.get(2)?,
        contact_email: row.get(3)?,
        status: status_raw.parse()?,
        order_handle: row.get(5)?,
        challenge_token: row.get(6)?,
        expected_digest: row.get(7)?,
        zone_id: row.get(8)?,
        zone_name: row.get(9)?,
        challenge_record: row.get(10)?,
        cert_path: row.get(11)?,
        key_path: row.get(12)?,
        chain_path: row.get(13)?,
        error_code: error_code_raw.map(|raw| raw.parse()).transpose()?,
        error_message: row.get(15)?,
        issue_date: parse_optional_timestamp(row.get(16)?, "issue_date")?,
        expiry_date: parse_optional_timestamp(row.get(17)?, "expiry_date")?,
        install_date: parse_optional_timestamp(row.get(18)?, "install_date")?,
        install_warnings: serde_json::from_str(&warnings_raw)
            .context("failed to deserialize install_warnings")?,
        fingerprint: row.get(20)?,
        created_at: parse_timestamp(&created_raw, "created_at")?,
        updated_at: parse_timestamp(&updated_raw, "updated_at")?,
        renewal_status: renewal_raw.parse()?,
    })
}

fn parse_timestamp(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {column} timestamp"))
}

fn parse_optional_timestamp(raw: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_timestamp(&value, column)).transpose()
}
