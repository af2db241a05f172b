//! Table definitions, applied one statement at a time on startup.
//!
//! All timestamps are stored as UTC milliseconds since the epoch. Identifiers
//! are stored in their hyphenated text form.

pub const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS processed_events (
        event_id TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        external_event_id TEXT NOT NULL,
        processed_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        aggregate_key TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        delivered_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbox_pending
        ON outbox (created_at, seq) WHERE delivered_at IS NULL",
    "CREATE TABLE IF NOT EXISTS payments (
        id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        lead_id TEXT,
        provider TEXT NOT NULL,
        provider_ref TEXT,
        status TEXT NOT NULL,
        amount_cents INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_payments_provider_ref ON payments (provider_ref)",
    "CREATE TABLE IF NOT EXISTS leads (
        id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        phone TEXT NOT NULL DEFAULT '',
        service_interest TEXT NOT NULL DEFAULT '',
        deposit_status TEXT,
        priority_level TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS outbound_messages (
        id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        from_number TEXT NOT NULL,
        to_number TEXT NOT NULL,
        body TEXT NOT NULL,
        media_urls TEXT NOT NULL DEFAULT '[]',
        provider_status TEXT NOT NULL,
        provider_message_id TEXT,
        send_attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        next_retry_at INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbound_messages_retry
        ON outbound_messages (provider_status, next_retry_at)",
    "CREATE TABLE IF NOT EXISTS hosted_orders (
        id TEXT PRIMARY KEY,
        clinic_id TEXT NOT NULL,
        e164_number TEXT NOT NULL,
        provider_order_id TEXT,
        status TEXT NOT NULL,
        last_error TEXT NOT NULL DEFAULT '',
        updated_at INTEGER NOT NULL,
        UNIQUE (clinic_id, e164_number)
    )",
    "CREATE TABLE IF NOT EXISTS velocity_counters (
        key TEXT PRIMARY KEY,
        count INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS velocity_members (
        key TEXT NOT NULL,
        member TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        PRIMARY KEY (key, member)
    )",
    "CREATE TABLE IF NOT EXISTS ttl_cache (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS delayed_tasks (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        payload BLOB NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        visible_after INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        completed_at INTEGER,
        cancelled_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_delayed_tasks_due
        ON delayed_tasks (visible_after) WHERE completed_at IS NULL AND cancelled_at IS NULL",
];
