use rusqlite::Connection;

const UP_SQL: &str = r#"
-- One row per (message, viewer). The primary key gives seenBy set semantics.
CREATE TABLE IF NOT EXISTS message_seen (
    message_id TEXT NOT NULL,               -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    seen_at    TEXT NOT NULL,               -- RFC-3339, micros

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
