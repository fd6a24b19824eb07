//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;

use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;

use crate::pipeline::InboundEvent;
use crate::scan::ArtifactScanResult;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Persist an inbound event. Returns the row id used to link findings and
/// analyses back to the event.
pub fn save_event(pool: &Pool, event: &InboundEvent, content_hash: &str) -> Result<i64> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO webhook_events (source_system, build_id, definition_id, content_hash, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            event.source_system,
            event.build_id,
            event.definition_id,
            content_hash,
            event.received_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Persist the post-filter findings and the scored analysis row for one
/// artifact, in a single transaction: findings never land without their
/// analysis row.
pub fn save_scan_result(pool: &Pool, event_id: i64, result: &ArtifactScanResult) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    for finding in &result.findings {
        tx.execute(
            "INSERT INTO security_findings
                 (event_id, rule_id, category, match_count, spans_json, matched_text, severity_weight)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                event_id,
                finding.rule_id,
                finding.category.as_str(),
                finding.spans.len() as i64,
                serde_json::to_string(&finding.spans)?,
                finding.matched_text,
                finding.severity_weight,
            ],
        )?;
    }

    tx.execute(
        "INSERT INTO artifact_analyses
             (event_id, artifact_id, artifact_kind, script_type, findings_count, risk_score, risk_level)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            event_id,
            result.artifact_id,
            result.kind.to_string(),
            format!("{:?}", result.script_type),
            result.findings.len() as i64,
            result.risk_score,
            result.risk_level.to_string(),
        ],
    )?;

    tx.commit()?;
    Ok(())
}

/// Aggregate per-rule statistics across all persisted findings.
pub fn pattern_statistics(pool: &Pool) -> Result<Vec<PatternStat>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT rule_id,
                COUNT(*) as occurrences,
                MAX(created_at) as last_seen,
                AVG(severity_weight) as avg_severity
         FROM security_findings
         GROUP BY rule_id
         ORDER BY occurrences DESC",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(PatternStat {
            rule_id: row.get(0)?,
            occurrences: row.get(1)?,
            last_seen: row.get(2)?,
            avg_severity: row.get(3)?,
        })
    })?;

    let mut stats = Vec::new();
    for r in rows {
        stats.push(r?);
    }
    Ok(stats)
}

/// Rebuild the latest persisted scan result for an event identity, for
/// recovery-sweep redispatch after a crash mid-dispatch.
pub fn load_scan_result(
    pool: &Pool,
    identity: &crate::dedup::EventIdentity,
) -> Result<Option<ArtifactScanResult>> {
    use crate::rules::RuleCategory;
    use crate::scan::{ArtifactKind, Finding, RiskLevel, ScriptType};

    let conn = pool.get()?;

    let event_id: Option<i64> = conn
        .query_row(
            "SELECT id FROM webhook_events
             WHERE source_system = ?1 AND build_id = ?2 AND definition_id = ?3
             ORDER BY id DESC LIMIT 1",
            rusqlite::params![identity.source_system, identity.build_id, identity.definition_id],
            |row| row.get(0),
        )
        .optional()?;
    let event_id = match event_id {
        Some(id) => id,
        None => return Ok(None),
    };

    let analysis: Option<(String, String, String, u8, String)> = conn
        .query_row(
            "SELECT artifact_id, artifact_kind, script_type, risk_score, risk_level
             FROM artifact_analyses WHERE event_id = ?1 ORDER BY id DESC LIMIT 1",
            [event_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()?;
    let (artifact_id, kind_str, script_str, risk_score, level_str) = match analysis {
        Some(a) => a,
        None => return Ok(None),
    };

    let mut stmt = conn.prepare(
        "SELECT rule_id, category, spans_json, matched_text, severity_weight
         FROM security_findings WHERE event_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([event_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, u8>(4)?,
        ))
    })?;

    let mut findings = Vec::new();
    for r in rows {
        let (rule_id, category, spans_json, matched_text, severity_weight) = r?;
        let category = match RuleCategory::parse(&category) {
            Some(c) => c,
            None => continue,
        };
        findings.push(Finding {
            rule_id,
            category,
            spans: serde_json::from_str(&spans_json).unwrap_or_default(),
            matched_text,
            severity_weight,
        });
    }

    Ok(Some(ArtifactScanResult {
        artifact_id,
        kind: ArtifactKind::parse(&kind_str).unwrap_or(ArtifactKind::Build),
        script_type: ScriptType::parse(&script_str),
        findings,
        risk_score,
        risk_level: RiskLevel::parse(&level_str),
    }))
}

#[derive(Debug, serde::Serialize)]
pub struct PatternStat {
    pub rule_id: String,
    pub occurrences: i64,
    pub last_seen: String,
    pub avg_severity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleCategory;
    use crate::scan::{ArtifactKind, Finding, RiskLevel, ScriptType};

    fn sample_event() -> InboundEvent {
        InboundEvent {
            source_system: "azure".into(),
            build_id: "42".into(),
            definition_id: "10".into(),
            kind: ArtifactKind::Definition,
            content: "eval(x)".into(),
            received_at: chrono::Utc::now(),
        }
    }

    fn sample_result() -> ArtifactScanResult {
        ArtifactScanResult {
            artifact_id: "definition-10-42".into(),
            kind: ArtifactKind::Definition,
            script_type: ScriptType::Unknown,
            findings: vec![Finding {
                rule_id: "eval".into(),
                category: RuleCategory::DynamicEvaluation,
                spans: vec![(0, 5)],
                matched_text: "eval(".into(),
                severity_weight: 10,
            }],
            risk_score: 10,
            risk_level: RiskLevel::Critical,
        }
    }

    #[test]
    fn test_save_scan_result_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("s.db").to_str().unwrap()).unwrap();

        let event = sample_event();
        let event_id = save_event(&pool, &event, "hash").unwrap();
        save_scan_result(&pool, event_id, &sample_result()).unwrap();

        let identity = event.identity();
        let loaded = load_scan_result(&pool, &identity).unwrap().unwrap();
        assert_eq!(loaded.risk_level, RiskLevel::Critical);
        assert_eq!(loaded.findings.len(), 1);
        assert_eq!(loaded.findings[0].spans, vec![(0, 5)]);
    }

    #[test]
    fn test_save_scan_result_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("s.db").to_str().unwrap()).unwrap();
        let event_id = save_event(&pool, &sample_event(), "hash").unwrap();

        // Break the analysis insert; the finding inserts must roll back with it.
        let conn = pool.get().unwrap();
        conn.execute_batch("DROP TABLE artifact_analyses;").unwrap();
        drop(conn);

        assert!(save_scan_result(&pool, event_id, &sample_result()).is_err());

        let conn = pool.get().unwrap();
        let findings: i64 = conn
            .query_row("SELECT COUNT(*) FROM security_findings", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(findings, 0);
    }
}
