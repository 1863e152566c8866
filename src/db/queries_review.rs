use super::queries::replace_entries;
use crate::models::{Invoice, InvoiceFields, InvoiceStatus, NewEntry, OcrTier};
use chrono::{NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

/// 列表查询条件 (全部可选)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceFilter {
    pub statuses: Vec<InvoiceStatus>,
    pub search: Option<String>,
    pub invoice_date_from: Option<NaiveDate>,
    pub invoice_date_to: Option<NaiveDate>,
    pub upload_date_from: Option<NaiveDate>,
    pub upload_date_to: Option<NaiveDate>,
}

fn push_status_list<'a>(builder: &mut QueryBuilder<'a, Sqlite>, statuses: &[InvoiceStatus]) {
    builder.push("status IN (");
    let mut separated = builder.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
}

async fn list_by_statuses(pool: &SqlitePool, statuses: &[InvoiceStatus]) -> Result<Vec<Invoice>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM invoices WHERE ");
    push_status_list(&mut builder, statuses);
    builder.push(" ORDER BY upload_date ASC, id ASC");
    builder.build_query_as::<Invoice>().fetch_all(pool).await
}

/// 审核队列: draft + exception，最早上传的在前
pub async fn list_awaiting(pool: &SqlitePool) -> Result<Vec<Invoice>, sqlx::Error> {
    list_by_statuses(pool, &InvoiceStatus::AWAITING).await
}

/// 处理队列: 仍在流水线中的发票
pub async fn list_processing(pool: &SqlitePool) -> Result<Vec<Invoice>, sqlx::Error> {
    list_by_statuses(pool, &InvoiceStatus::IN_FLIGHT).await
}

/// 条件查询，最新的在前
pub async fn list_invoices(pool: &SqlitePool, filter: &InvoiceFilter) -> Result<Vec<Invoice>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM invoices WHERE 1 = 1");

    if !filter.statuses.is_empty() {
        builder.push(" AND ");
        push_status_list(&mut builder, &filter.statuses);
    }

    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search);
        builder
            .push(" AND (supplier_name LIKE ")
            .push_bind(pattern.clone())
            .push(" OR invoice_number LIKE ")
            .push_bind(pattern.clone())
            .push(" OR display_name LIKE ")
            .push_bind(pattern.clone())
            .push(" OR notes LIKE ")
            .push_bind(pattern)
            .push(")");
    }

    if let Some(from) = filter.invoice_date_from {
        builder.push(" AND invoice_date >= ").push_bind(from);
    }
    if let Some(to) = filter.invoice_date_to {
        builder.push(" AND invoice_date <= ").push_bind(to);
    }
    // upload_date 存的是带时区的时间戳，按日期部分比较
    if let Some(from) = filter.upload_date_from {
        builder.push(" AND substr(upload_date, 1, 10) >= ").push_bind(from.format("%Y-%m-%d").to_string());
    }
    if let Some(to) = filter.upload_date_to {
        builder.push(" AND substr(upload_date, 1, 10) <= ").push_bind(to.format("%Y-%m-%d").to_string());
    }

    builder.push(" ORDER BY id DESC");
    builder.build_query_as::<Invoice>().fetch_all(pool).await
}

/// 按 id 批量查询 (导出用)，保持 id 升序
pub async fn get_invoices_by_ids(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<Invoice>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM invoices WHERE id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") ORDER BY id ASC");
    builder.build_query_as::<Invoice>().fetch_all(pool).await
}

/// 审核队列中下一张待审发票 (排除刚处理的那张)
pub async fn next_awaiting(pool: &SqlitePool, exclude_id: i64) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT id FROM invoices
        WHERE status IN ('draft', 'exception') AND id <> ?
        ORDER BY upload_date ASC, id ASC
        LIMIT 1
        "#,
    )
    .bind(exclude_id)
    .fetch_optional(pool)
    .await
}

/// 审核通过: 覆盖字段 + 整体替换明细 + 状态置为 approved (单事务)
///
/// 状态不是 draft/exception 时不写入任何内容，返回 false。
pub async fn approve_invoice(
    pool: &SqlitePool,
    invoice_id: i64,
    display_name: &str,
    fields: &InvoiceFields,
    entries: &[NewEntry],
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE invoices
        SET status = 'approved', approved_date = ?, display_name = ?,
            supplier_name = ?, invoice_number = ?, invoice_date = ?, due_date = ?,
            currency = ?, gst_number = ?, total_amount = ?, gst_amount = ?, notes = ?,
            exception_type = NULL, exception_details = NULL
        WHERE id = ? AND status IN ('draft', 'exception')
        "#,
    )
    .bind(Utc::now())
    .bind(display_name)
    .bind(&fields.supplier_name)
    .bind(&fields.invoice_number)
    .bind(fields.invoice_date)
    .bind(fields.due_date)
    .bind(&fields.currency)
    .bind(&fields.gst_number)
    .bind(fields.total_amount.as_ref().map(|v| v.to_string()))
    .bind(fields.gst_amount.as_ref().map(|v| v.to_string()))
    .bind(&fields.notes)
    .bind(invoice_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    replace_entries(&mut tx, invoice_id, entries).await?;
    tx.commit().await?;
    Ok(true)
}

/// 人工重新处理: 回到 extracting 并开启新一轮尝试，返回新的 attempt
///
/// 已审核 / 已完成 / 已用过第 3 层的发票不会被修改。
pub async fn begin_reprocess(pool: &SqlitePool, invoice_id: i64, tier: OcrTier) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE invoices
        SET status = 'extracting', ocr_tier = ?, exception_type = NULL, exception_details = NULL,
            error_message = NULL, attempt = attempt + 1
        WHERE id = ?
          AND status NOT IN ('approved', 'complete')
          AND (ocr_tier IS NULL OR ocr_tier < 3)
        RETURNING attempt
        "#,
    )
    .bind(tier.number() as i64)
    .bind(invoice_id)
    .fetch_all(pool)
    .await
    .map(|rows| rows.into_iter().next())
}

/// approved → complete
pub async fn mark_complete(pool: &SqlitePool, invoice_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE invoices SET status = 'complete' WHERE id = ? AND status = 'approved'")
        .bind(invoice_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// 删除发票及明细，返回原文件存储路径；发票不存在时返回 None
pub async fn delete_invoice(pool: &SqlitePool, invoice_id: i64) -> Result<Option<Option<String>>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let deleted = sqlx::query_scalar::<_, Option<String>>("DELETE FROM invoices WHERE id = ? RETURNING file_path")
        .bind(invoice_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .next();

    if deleted.is_none() {
        tx.rollback().await?;
        return Ok(None);
    }

    sqlx::query("DELETE FROM invoice_entries WHERE invoice_id = ?")
        .bind(invoice_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(deleted)
}
