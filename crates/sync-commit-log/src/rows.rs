//! Generic server-row storage backing the default table handler.
//!
//! Application rows live in one physical `sync_rows` table keyed by
//! `(partition, table, row_id)`, with the row body as JSON, a monotonically
//! increasing `row_version`, and the extracted scopes of the row. Custom
//! handlers with their own tables bypass this module entirely.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::db::{SqlParam, SyncTxn};
use crate::error::{Error, Result};
use crate::model::{ScopeFilter, now_unix_ms};
use crate::store::{row_i64, row_json_value, row_string};

/// A stored server row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
   pub row_id: String,
   pub row_json: JsonValue,
   pub row_version: i64,
   pub scopes: IndexMap<String, String>,
}

/// Load one row by primary key.
///
/// Inside a write transaction on a dialect with row locking, the row is
/// locked until the transaction ends so concurrent writers serialize on it.
pub async fn get_row(
   txn: &mut SyncTxn,
   partition_id: &str,
   table: &str,
   row_id: &str,
) -> Result<Option<StoredRow>> {
   let mut sql = String::from(
      "SELECT row_id, row_json, row_version, scopes FROM sync_rows \
       WHERE partition_id = $1 AND table_name = $2 AND row_id = $3",
   );
   if txn.dialect().supports_for_update() {
      sql.push_str(" FOR UPDATE");
   }
   let row = txn
      .fetch_one(
         &sql,
         vec![
            SqlParam::Text(partition_id.to_string()),
            SqlParam::Text(table.to_string()),
            SqlParam::Text(row_id.to_string()),
         ],
      )
      .await?;
   row.map(|r| stored_row_from_row(&r)).transpose()
}

/// Insert or replace a row at the given version.
pub async fn put_row(
   txn: &mut SyncTxn,
   partition_id: &str,
   table: &str,
   row: &StoredRow,
) -> Result<()> {
   let scopes_json = JsonValue::Object(
      row
         .scopes
         .iter()
         .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
         .collect(),
   );
   txn
      .execute(
         "INSERT INTO sync_rows (partition_id, table_name, row_id, row_json, row_version, scopes, updated_at) \
          VALUES ($1, $2, $3, $4, $5, $6, $7) \
          ON CONFLICT (partition_id, table_name, row_id) DO UPDATE SET \
             row_json = excluded.row_json, \
             row_version = excluded.row_version, \
             scopes = excluded.scopes, \
             updated_at = excluded.updated_at",
         vec![
            SqlParam::Text(partition_id.to_string()),
            SqlParam::Text(table.to_string()),
            SqlParam::Text(row.row_id.clone()),
            SqlParam::Json(row.row_json.clone()),
            SqlParam::I64(row.row_version),
            SqlParam::Json(scopes_json),
            SqlParam::I64(now_unix_ms()),
         ],
      )
      .await?;
   Ok(())
}

/// Delete a row by primary key; returns whether a row existed.
pub async fn delete_row(
   txn: &mut SyncTxn,
   partition_id: &str,
   table: &str,
   row_id: &str,
) -> Result<bool> {
   let result = txn
      .execute(
         "DELETE FROM sync_rows WHERE partition_id = $1 AND table_name = $2 AND row_id = $3",
         vec![
            SqlParam::Text(partition_id.to_string()),
            SqlParam::Text(table.to_string()),
            SqlParam::Text(row_id.to_string()),
         ],
      )
      .await?;
   Ok(result.rows_affected > 0)
}

/// One keyset-paginated snapshot page, ordered by `row_id`, starting
/// strictly after `after_row_id`.
pub async fn snapshot_page(
   txn: &mut SyncTxn,
   partition_id: &str,
   table: &str,
   scope_filter: &ScopeFilter,
   after_row_id: Option<&str>,
   limit: i64,
) -> Result<Vec<StoredRow>> {
   let dialect = txn.dialect();
   let mut params = vec![
      SqlParam::Text(partition_id.to_string()),
      SqlParam::Text(table.to_string()),
   ];
   let mut next_idx = 3;
   let mut conditions = vec![
      "partition_id = $1".to_string(),
      "table_name = $2".to_string(),
   ];

   if let Some(after) = after_row_id {
      conditions.push(format!("row_id > ${next_idx}"));
      next_idx += 1;
      params.push(SqlParam::Text(after.to_string()));
   }

   let (scope_fragments, scope_params) = scope_filter.to_sql(dialect, "scopes", &mut next_idx);
   conditions.extend(scope_fragments);
   params.extend(scope_params);

   let sql = format!(
      "SELECT row_id, row_json, row_version, scopes FROM sync_rows \
       WHERE {} ORDER BY row_id LIMIT ${next_idx}",
      conditions.join(" AND ")
   );
   params.push(SqlParam::I64(limit));

   let rows = txn.fetch_all(&sql, params).await?;
   rows.iter().map(stored_row_from_row).collect()
}

fn stored_row_from_row(row: &crate::decode::JsonRow) -> Result<StoredRow> {
   let row_json = row_json_value(row, "row_json")?.ok_or_else(|| Error::CorruptValue {
      context: "server row",
      message: "row_json is null".into(),
   })?;
   let scopes = match row_json_value(row, "scopes")? {
      Some(JsonValue::Object(map)) => map
         .into_iter()
         .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
         .collect(),
      _ => IndexMap::new(),
   };
   Ok(StoredRow {
      row_id: row_string(row, "row_id")?,
      row_json,
      row_version: row_i64(row, "row_version")?,
      scopes,
   })
}
