//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `identities`, `conversations`,
//! `memberships`, `channels` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identities (cache of what the session collaborator told us)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identities (
    id            TEXT PRIMARY KEY NOT NULL,  -- opaque, issued upstream
    domain        TEXT NOT NULL,              -- lowercased email domain
    display_name  TEXT,
    first_seen_at TEXT NOT NULL,              -- RFC-3339
    last_seen_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_identities_domain ON identities(domain);

-- ----------------------------------------------------------------
-- Conversations (direct and group)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id               TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    kind             TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
    name             TEXT,                       -- required for groups
    created_at       TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,

    CHECK (kind = 'direct' OR name IS NOT NULL)
);

-- ----------------------------------------------------------------
-- Memberships. A departed member keeps its row with left_at set.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS memberships (
    conversation_id TEXT NOT NULL,               -- FK -> conversations(id)
    identity_id     TEXT NOT NULL,
    role            TEXT NOT NULL CHECK (role IN ('member', 'admin')),
    joined_at       TEXT NOT NULL,
    left_at         TEXT,                        -- NULL while current

    PRIMARY KEY (conversation_id, identity_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_memberships_identity
    ON memberships(identity_id, left_at);

-- ----------------------------------------------------------------
-- Channels (domain-wide, implicit membership)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id               TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    domain           TEXT NOT NULL,
    name             TEXT NOT NULL,
    description      TEXT,
    created_at       TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,

    UNIQUE (domain, name)
);

-- ----------------------------------------------------------------
-- Messages. Exactly one of conversation_id / channel_id is set.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id     TEXT,                       -- FK -> conversations(id)
    channel_id          TEXT,                       -- FK -> channels(id)
    seq                 INTEGER NOT NULL,           -- per-target order
    sender_id           TEXT NOT NULL,
    sender_display_name TEXT,
    body                TEXT NOT NULL CHECK (length(body) > 0),
    message_type        TEXT NOT NULL DEFAULT 'text',
    client_ref          TEXT,
    delivery_state      TEXT NOT NULL DEFAULT 'sent'
                        CHECK (delivery_state IN ('sent', 'delivered', 'read')),
    created_at          TEXT NOT NULL,

    CHECK ((conversation_id IS NULL) <> (channel_id IS NULL)),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq) WHERE conversation_id IS NOT NULL;

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_channel_seq
    ON messages(channel_id, seq) WHERE channel_id IS NOT NULL;

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_ref
    ON messages(sender_id, client_ref) WHERE client_ref IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_messages_conversation_sender
    ON messages(conversation_id, sender_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
