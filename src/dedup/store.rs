//! SQLite-backed dedup store with an atomic claim operation.

use super::{AlertStatus, ClaimOutcome, DedupRecord, EventIdentity};
use crate::storage::Pool;
use anyhow::{Context, Result};
use rusqlite::params;
use tracing::{info, warn};

/// Tracks which build events have already produced a dispatched alert.
#[derive(Clone)]
pub struct DedupStore {
    pool: Pool,
}

impl DedupStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Atomically claim the right to alert on this event identity.
    ///
    /// A single conditional INSERT against the UNIQUE key, never a separate
    /// read-then-write: under concurrent delivery of the same build event
    /// exactly one caller observes [`ClaimOutcome::Claimed`].
    pub fn claim(&self, identity: &EventIdentity) -> Result<ClaimOutcome> {
        let conn = self.pool.get()?;
        let inserted = conn
            .execute(
                "INSERT INTO dedup_records (source_system, build_id, definition_id, content_hash)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (source_system, build_id, definition_id) DO NOTHING",
                params![
                    identity.source_system,
                    identity.build_id,
                    identity.definition_id,
                    identity.content_hash,
                ],
            )
            .context("claim insert failed")?;

        if inserted == 1 {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }

    /// Transition the record to SENT after a successful dispatch.
    pub fn mark_sent(&self, identity: &EventIdentity) -> Result<()> {
        self.transition(identity, AlertStatus::Sent, None)
    }

    /// Transition the record to FAILED after retry exhaustion. The record
    /// stays inspectable for manual replay; the finding data is never lost.
    pub fn mark_failed(&self, identity: &EventIdentity, reason: &str) -> Result<()> {
        self.transition(identity, AlertStatus::Failed, Some(reason))
    }

    fn transition(
        &self,
        identity: &EventIdentity,
        status: AlertStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE dedup_records
             SET alert_status = ?1, failure_reason = ?2, updated_at = datetime('now')
             WHERE source_system = ?3 AND build_id = ?4 AND definition_id = ?5",
            params![
                status.as_str(),
                reason,
                identity.source_system,
                identity.build_id,
                identity.definition_id,
            ],
        )?;
        if changed == 0 {
            warn!(event = %identity, status = status.as_str(), "No dedup record to transition");
        }
        Ok(())
    }

    /// Recovery sweep: hand back identities stuck PENDING past `timeout_secs`.
    ///
    /// Each record is re-claimable exactly once (the `reclaims` guard), so a
    /// crash mid-dispatch is retryable without becoming an infinite loop. Runs
    /// inside an immediate transaction so concurrent sweeps cannot hand the
    /// same record to two recoverers.
    pub fn reclaim_stale(&self, timeout_secs: u64) -> Result<Vec<EventIdentity>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let stale: Vec<EventIdentity> = {
            let mut stmt = tx.prepare(
                "SELECT source_system, build_id, definition_id, content_hash
                 FROM dedup_records
                 WHERE alert_status = 'PENDING'
                   AND reclaims = 0
                   AND claimed_at < datetime('now', ?1)",
            )?;
            let window = format!("-{timeout_secs} seconds");
            let rows = stmt.query_map(params![window], |row| {
                Ok(EventIdentity {
                    source_system: row.get(0)?,
                    build_id: row.get(1)?,
                    definition_id: row.get(2)?,
                    content_hash: row.get(3)?,
                })
            })?;
            rows.collect::<Result<_, _>>()?
        };

        for identity in &stale {
            tx.execute(
                "UPDATE dedup_records
                 SET reclaims = reclaims + 1, claimed_at = datetime('now'), updated_at = datetime('now')
                 WHERE source_system = ?1 AND build_id = ?2 AND definition_id = ?3",
                params![identity.source_system, identity.build_id, identity.definition_id],
            )?;
        }

        tx.commit()?;
        if !stale.is_empty() {
            info!(count = stale.len(), "Reclaimed stale pending alerts");
        }
        Ok(stale)
    }

    /// Recent audit records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<DedupRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT source_system, build_id, definition_id, content_hash,
                    alert_status, failure_reason, reclaims, claimed_at
             FROM dedup_records
             ORDER BY claimed_at DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], |row| {
            Ok(DedupRecord {
                identity: EventIdentity {
                    source_system: row.get(0)?,
                    build_id: row.get(1)?,
                    definition_id: row.get(2)?,
                    content_hash: row.get(3)?,
                },
                alert_status: AlertStatus::parse(&row.get::<_, String>(4)?),
                failure_reason: row.get(5)?,
                reclaims: row.get(6)?,
                claimed_at: row.get(7)?,
            })
        })?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn store() -> (tempfile::TempDir, DedupStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let pool = open_pool(db.to_str().unwrap()).unwrap();
        (dir, DedupStore::new(pool))
    }

    fn identity(build: &str, hash: &str) -> EventIdentity {
        EventIdentity {
            source_system: "azure".into(),
            build_id: build.into(),
            definition_id: "10".into(),
            content_hash: hash.into(),
        }
    }

    #[test]
    fn test_first_claim_wins_second_skips() {
        let (_dir, store) = store();
        assert_eq!(store.claim(&identity("42", "aaa")).unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.claim(&identity("42", "aaa")).unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[test]
    fn test_different_content_hash_same_build_still_dedups() {
        let (_dir, store) = store();
        assert_eq!(store.claim(&identity("42", "aaa")).unwrap(), ClaimOutcome::Claimed);
        // Redelivered webhook, same build, different payload bytes.
        assert_eq!(
            store.claim(&identity("42", "bbb")).unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
    }

    #[test]
    fn test_status_transitions() {
        let (_dir, store) = store();
        let id = identity("42", "aaa");
        store.claim(&id).unwrap();
        store.mark_sent(&id).unwrap();
        let records = store.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alert_status, AlertStatus::Sent);

        let id2 = identity("43", "ccc");
        store.claim(&id2).unwrap();
        store.mark_failed(&id2, "transport exhausted").unwrap();
        let records = store.recent(10).unwrap();
        let failed = records
            .iter()
            .find(|r| r.identity.build_id == "43")
            .unwrap();
        assert_eq!(failed.alert_status, AlertStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("transport exhausted"));
    }

    #[test]
    fn test_reclaim_only_touches_stale_pending() {
        let (_dir, store) = store();
        let id = identity("42", "aaa");
        store.claim(&id).unwrap();

        // Freshly claimed: nothing is stale yet.
        assert!(store.reclaim_stale(3600).unwrap().is_empty());

        // Backdate the claim, then it becomes reclaimable exactly once.
        let conn = store.pool.get().unwrap();
        conn.execute(
            "UPDATE dedup_records SET claimed_at = datetime('now', '-2 hours')",
            [],
        )
        .unwrap();
        drop(conn);

        let first = store.reclaim_stale(3600).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].build_id, "42");

        let conn = store.pool.get().unwrap();
        conn.execute(
            "UPDATE dedup_records SET claimed_at = datetime('now', '-2 hours')",
            [],
        )
        .unwrap();
        drop(conn);

        // Second sweep: reclaims guard blocks it.
        assert!(store.reclaim_stale(3600).unwrap().is_empty());
    }

    #[test]
    fn test_sent_record_never_reclaimed() {
        let (_dir, store) = store();
        let id = identity("42", "aaa");
        store.claim(&id).unwrap();
        store.mark_sent(&id).unwrap();

        let conn = store.pool.get().unwrap();
        conn.execute(
            "UPDATE dedup_records SET claimed_at = datetime('now', '-2 hours')",
            [],
        )
        .unwrap();
        drop(conn);

        assert!(store.reclaim_stale(3600).unwrap().is_empty());
    }
}
