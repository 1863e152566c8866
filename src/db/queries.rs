use crate::models::{
    Classification, ExtractionOutcome, Invoice, InvoiceEntry, InvoiceStatus, NewEntry, OcrTier,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

/// 新建发票行所需的字段
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub original_filename: String,
    pub display_name: String,
    pub file_hash: String,
    pub upload_date: DateTime<Utc>,
}

fn decimal_text(value: &Option<BigDecimal>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

/// 按内容哈希查找已存在的发票, 返回 (id, display_name)
pub async fn find_by_hash(
    pool: &SqlitePool,
    file_hash: &str,
) -> Result<Option<(i64, String)>, sqlx::Error> {
    sqlx::query_as::<_, (i64, String)>(
        r#"
        SELECT id, display_name
        FROM invoices
        WHERE file_hash = ?
        "#,
    )
    .bind(file_hash)
    .fetch_optional(pool)
    .await
}

/// 插入发票主表 (status = queued)，哈希冲突时返回唯一约束错误
///
/// RETURNING 语句一律 fetch_all 读完，SQLite 才会结束语句、提交自动事务。
pub async fn insert_invoice(pool: &SqlitePool, invoice: &NewInvoice) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO invoices (original_filename, display_name, file_hash, status, upload_date, attempt)
        VALUES (?, ?, ?, 'queued', ?, 1)
        RETURNING id
        "#,
    )
    .bind(&invoice.original_filename)
    .bind(&invoice.display_name)
    .bind(&invoice.file_hash)
    .bind(invoice.upload_date)
    .fetch_all(pool)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)
}

pub async fn set_file_path(pool: &SqlitePool, invoice_id: i64, file_path: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE invoices SET file_path = ? WHERE id = ?")
        .bind(file_path)
        .bind(invoice_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// 查询发票主表
pub async fn get_invoice(pool: &SqlitePool, invoice_id: i64) -> Result<Option<Invoice>, sqlx::Error> {
    sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE id = ?")
        .bind(invoice_id)
        .fetch_optional(pool)
        .await
}

/// 查询明细 (按 sort_order)
pub async fn list_entries(pool: &SqlitePool, invoice_id: i64) -> Result<Vec<InvoiceEntry>, sqlx::Error> {
    sqlx::query_as::<_, InvoiceEntry>(
        r#"
        SELECT id, invoice_id, label, amount, entry_type, attrs, sort_order
        FROM invoice_entries
        WHERE invoice_id = ?
        ORDER BY sort_order ASC, id ASC
        "#,
    )
    .bind(invoice_id)
    .fetch_all(pool)
    .await
}

/// 整体替换明细，sort_order 按传入顺序重排为 0..n
pub async fn replace_entries(
    conn: &mut SqliteConnection,
    invoice_id: i64,
    entries: &[NewEntry],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM invoice_entries WHERE invoice_id = ?")
        .bind(invoice_id)
        .execute(&mut *conn)
        .await?;

    if entries.is_empty() {
        return Ok(());
    }

    let mut query_builder = sqlx::QueryBuilder::new(
        "INSERT INTO invoice_entries (invoice_id, label, amount, entry_type, attrs, sort_order) ",
    );
    query_builder.push_values(entries.iter().enumerate(), |mut b, (idx, entry)| {
        let attrs = serde_json::Value::Object(entry.attrs.to_map()).to_string();
        b.push_bind(invoice_id)
            .push_bind(entry.label.trim().to_string())
            .push_bind(decimal_text(&entry.amount))
            .push_bind(entry.entry_type.as_str())
            .push_bind(attrs)
            .push_bind(idx as i64);
    });
    query_builder.build().execute(&mut *conn).await?;
    Ok(())
}

/// 工作线程推进阶段 (extracting / processing / verifying)
///
/// 只在 attempt 未被新请求取代时生效，返回是否写入。
pub async fn update_stage(
    pool: &SqlitePool,
    invoice_id: i64,
    attempt: i64,
    status: InvoiceStatus,
    tier: OcrTier,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE invoices
        SET status = ?, ocr_tier = ?
        WHERE id = ? AND attempt = ?
        "#,
    )
    .bind(status.as_str())
    .bind(tier.number() as i64)
    .bind(invoice_id)
    .bind(attempt)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// 写入抽取结果 + 分类结论 + 明细 (单事务)
pub async fn store_extraction(
    pool: &SqlitePool,
    invoice_id: i64,
    attempt: i64,
    outcome: &ExtractionOutcome,
    classification: &Classification,
    display_name: &str,
) -> Result<bool, sqlx::Error> {
    let fields = &outcome.extraction.fields;
    let mut tx = pool.begin().await?;

    // 先写主表拿到写锁，attempt 不匹配说明结果已被取代
    let result = sqlx::query(
        r#"
        UPDATE invoices
        SET status = ?, ocr_tier = ?, exception_type = ?, exception_details = ?,
            display_name = ?, supplier_name = ?, invoice_number = ?, invoice_date = ?,
            due_date = ?, currency = ?, gst_number = ?, total_amount = ?, gst_amount = ?,
            notes = ?, error_message = NULL
        WHERE id = ? AND attempt = ?
        "#,
    )
    .bind(classification.target_status().as_str())
    .bind(outcome.tier.number() as i64)
    .bind(classification.exception_type.as_str())
    .bind(&classification.details)
    .bind(display_name)
    .bind(&fields.supplier_name)
    .bind(&fields.invoice_number)
    .bind(fields.invoice_date)
    .bind(fields.due_date)
    .bind(&fields.currency)
    .bind(&fields.gst_number)
    .bind(decimal_text(&fields.total_amount))
    .bind(decimal_text(&fields.gst_amount))
    .bind(&fields.notes)
    .bind(invoice_id)
    .bind(attempt)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    replace_entries(&mut tx, invoice_id, &outcome.extraction.entries).await?;
    tx.commit().await?;
    Ok(true)
}

/// 所有层级耗尽 → error
pub async fn mark_error(
    pool: &SqlitePool,
    invoice_id: i64,
    attempt: i64,
    tier: Option<OcrTier>,
    message: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE invoices
        SET status = 'error', error_message = ?, ocr_tier = COALESCE(?, ocr_tier)
        WHERE id = ? AND attempt = ?
        "#,
    )
    .bind(message)
    .bind(tier.map(|t| t.number() as i64))
    .bind(invoice_id)
    .bind(attempt)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// 启动时找出上次未处理完的发票
pub async fn list_in_flight(pool: &SqlitePool) -> Result<Vec<Invoice>, sqlx::Error> {
    sqlx::query_as::<_, Invoice>(
        r#"
        SELECT * FROM invoices
        WHERE status IN ('queued', 'extracting', 'processing', 'verifying')
        ORDER BY upload_date ASC, id ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

/// 开启新一轮抽取尝试，旧尝试的写入随之失效
pub async fn bump_attempt(pool: &SqlitePool, invoice_id: i64) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE invoices SET attempt = attempt + 1
        WHERE id = ?
        RETURNING attempt
        "#,
    )
    .bind(invoice_id)
    .fetch_all(pool)
    .await
    .map(|rows| rows.into_iter().next())
}
