use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

/// 建表语句 (幂等)
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS invoices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        original_filename TEXT NOT NULL,
        display_name TEXT NOT NULL,
        file_hash TEXT NOT NULL,
        file_path TEXT,
        status TEXT NOT NULL DEFAULT 'queued',
        ocr_tier INTEGER,
        exception_type TEXT,
        exception_details TEXT,
        supplier_name TEXT,
        invoice_number TEXT,
        invoice_date TEXT,
        due_date TEXT,
        currency TEXT,
        gst_number TEXT,
        total_amount TEXT,
        gst_amount TEXT,
        notes TEXT,
        error_message TEXT,
        upload_date TEXT NOT NULL,
        approved_date TEXT,
        attempt INTEGER NOT NULL DEFAULT 1
    )
    "#,
    // 内容哈希唯一: 并发上传同一文件时只有一个 INSERT 能成功
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_file_hash ON invoices (file_hash)",
    "CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices (status, upload_date)",
    r#"
    CREATE TABLE IF NOT EXISTS invoice_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        invoice_id INTEGER NOT NULL REFERENCES invoices (id) ON DELETE CASCADE,
        label TEXT NOT NULL,
        amount TEXT,
        entry_type TEXT NOT NULL,
        attrs TEXT NOT NULL DEFAULT '{}',
        sort_order INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_invoice_entries_invoice ON invoice_entries (invoice_id, sort_order)",
];

/// 创建数据库连接池
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        // 设置慢查询日志阈值为 5秒
        .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await
}

/// 执行建表
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Database schema ready");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool(dir: &std::path::Path) -> SqlitePool {
    let url = format!("sqlite://{}", dir.join("invoices.db").display());
    let pool = create_pool(&url, 4).await.unwrap();
    migrate(&pool).await.unwrap();
    pool
}
