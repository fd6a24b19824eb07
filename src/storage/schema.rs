//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS webhook_events (
            id INTEGER PRIMARY KEY,
            source_system TEXT NOT NULL,
            build_id TEXT NOT NULL,
            definition_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            received_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS security_findings (
            id INTEGER PRIMARY KEY,
            event_id INTEGER NOT NULL,
            rule_id TEXT NOT NULL,
            category TEXT NOT NULL,
            match_count INTEGER NOT NULL,
            spans_json TEXT NOT NULL DEFAULT '[]',
            matched_text TEXT NOT NULL,
            severity_weight INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (event_id) REFERENCES webhook_events(id)
        );

        CREATE TABLE IF NOT EXISTS artifact_analyses (
            id INTEGER PRIMARY KEY,
            event_id INTEGER NOT NULL,
            artifact_id TEXT NOT NULL,
            artifact_kind TEXT NOT NULL,
            script_type TEXT NOT NULL,
            findings_count INTEGER NOT NULL,
            risk_score INTEGER NOT NULL,
            risk_level TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (event_id) REFERENCES webhook_events(id)
        );

        CREATE TABLE IF NOT EXISTS dedup_records (
            id INTEGER PRIMARY KEY,
            source_system TEXT NOT NULL,
            build_id TEXT NOT NULL,
            definition_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            alert_status TEXT NOT NULL DEFAULT 'PENDING',
            failure_reason TEXT,
            reclaims INTEGER NOT NULL DEFAULT 0,
            claimed_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (source_system, build_id, definition_id)
        );

        CREATE INDEX IF NOT EXISTS idx_events_created ON webhook_events(created_at);
        CREATE INDEX IF NOT EXISTS idx_findings_event ON security_findings(event_id);
        CREATE INDEX IF NOT EXISTS idx_findings_rule ON security_findings(rule_id);
        CREATE INDEX IF NOT EXISTS idx_analyses_event ON artifact_analyses(event_id);
        CREATE INDEX IF NOT EXISTS idx_dedup_status ON dedup_records(alert_status);",
    )?;

    Ok(())
}
