use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Block list: blocker no longer receives live DIRECT messages from blocked
CREATE TABLE IF NOT EXISTS blocks (
    blocker_id TEXT NOT NULL,
    blocked_id TEXT NOT NULL,
    created_at TEXT NOT NULL,              -- ISO-8601

    PRIMARY KEY (blocker_id, blocked_id)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
