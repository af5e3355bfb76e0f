//! Inline schema for the two persisted tables (§6): `ASTMServerMessages`
//! (inbound audit) and `ASTMOrderMessages` (outbound orders). Follows the
//! teacher's `storage/migrations.rs` convention of hand-written
//! `CREATE TABLE IF NOT EXISTS` SQL, run directly through `sqlx` instead of
//! the Tauri SQL plugin (this core is not a Tauri app).

use sqlx::SqlitePool;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "create_astm_server_messages",
        r#"
        CREATE TABLE IF NOT EXISTS astm_server_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            instrument TEXT NOT NULL,
            raw_text TEXT NOT NULL,
            message_type TEXT NOT NULL,
            status TEXT NOT NULL,
            received_at TEXT NOT NULL,
            processed_at TEXT,
            published_at TEXT,
            error TEXT,
            remote_addr TEXT,
            result_count INTEGER NOT NULL DEFAULT 0,
            order_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_astm_server_messages_status ON astm_server_messages (status);
        CREATE INDEX IF NOT EXISTS idx_astm_server_messages_instrument ON astm_server_messages (instrument, received_at);
        "#,
    ),
    (
        "create_astm_order_messages",
        r#"
        CREATE TABLE IF NOT EXISTS astm_order_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            instrument TEXT NOT NULL,
            content TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_retry_at TEXT,
            next_retry_at TEXT,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_astm_order_messages_status ON astm_order_messages (status, next_retry_at);
        CREATE INDEX IF NOT EXISTS idx_astm_order_messages_instrument ON astm_order_messages (instrument);
        "#,
    ),
];

/// Run every migration, in order, idempotently (`IF NOT EXISTS`). Each
/// migration's SQL block may hold several `;`-terminated statements; sqlx's
/// SQLite driver executes one prepared statement at a time, so the block is
/// split before binding.
pub async fn run(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for (description, sql) in MIGRATIONS {
        log::debug!("running migration: {description}");
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(pool).await?;
        }
    }
    Ok(())
}
