//! Row decoding into JSON maps.
//!
//! Every query in this crate returns rows as ordered `IndexMap<String,
//! JsonValue>` so callers stay independent of the driver in use. Decoding is
//! driven by the driver's column type info; BLOB/BYTEA values are encoded as
//! base64 strings since JSON has no native binary type.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteRow, SqliteValueRef};
use sqlx::{Column, Row, TypeInfo, Value, ValueRef};

use crate::error::{Error, Result};

/// A decoded row: column name to JSON value, in select-list order.
pub type JsonRow = IndexMap<String, JsonValue>;

/// Decode a full SQLite row.
pub fn sqlite_row_to_json(row: &SqliteRow) -> Result<JsonRow> {
   let mut out = IndexMap::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      let value = row.try_get_raw(i)?;
      out.insert(column.name().to_string(), sqlite_value_to_json(value)?);
   }
   Ok(out)
}

/// Convert a single SQLite value to JSON based on its type affinity.
fn sqlite_value_to_json(value: SqliteValueRef) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let column_type = value.type_info();

   let result = match column_type.name() {
      "TEXT" | "DATE" | "TIME" | "DATETIME" => {
         match value.to_owned().try_decode::<String>() {
            Ok(v) => JsonValue::String(v),
            Err(_) => JsonValue::Null,
         }
      }

      "REAL" => match value.to_owned().try_decode::<f64>() {
         Ok(v) => JsonValue::from(v),
         Err(_) => JsonValue::Null,
      },

      "INTEGER" | "NUMERIC" => match value.to_owned().try_decode::<i64>() {
         Ok(v) => JsonValue::Number(v.into()),
         Err(_) => JsonValue::Null,
      },

      "BOOLEAN" => match value.to_owned().try_decode::<bool>() {
         Ok(v) => JsonValue::Bool(v),
         Err(_) => JsonValue::Null,
      },

      "BLOB" => match value.to_owned().try_decode::<Vec<u8>>() {
         Ok(blob) => JsonValue::String(base64_encode(&blob)),
         Err(_) => JsonValue::Null,
      },

      "NULL" => JsonValue::Null,

      other => {
         // Unknown affinity: fall back to text
         if let Ok(text) = value.to_owned().try_decode::<String>() {
            JsonValue::String(text)
         } else {
            return Err(Error::UnsupportedDatatype(format!(
               "unknown sqlite type: {other}"
            )));
         }
      }
   };

   Ok(result)
}

/// Base64 encode binary data for JSON serialization.
pub(crate) fn base64_encode(data: &[u8]) -> String {
   use base64::Engine;
   base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a base64 string back into bytes (the inverse of how BLOB columns
/// are surfaced in [`JsonRow`]s).
pub(crate) fn base64_decode(data: &str) -> Result<Vec<u8>> {
   use base64::Engine;
   base64::engine::general_purpose::STANDARD
      .decode(data)
      .map_err(|e| Error::CorruptValue {
         context: "base64 blob",
         message: e.to_string(),
      })
}

#[cfg(feature = "postgres")]
pub use pg::pg_row_to_json;

#[cfg(feature = "postgres")]
mod pg {
   use super::*;
   use sqlx::postgres::{PgRow, PgValueRef};

   /// Decode a full Postgres row.
   pub fn pg_row_to_json(row: &PgRow) -> Result<JsonRow> {
      let mut out = IndexMap::with_capacity(row.columns().len());
      for (i, column) in row.columns().iter().enumerate() {
         let value = row.try_get_raw(i)?;
         out.insert(column.name().to_string(), pg_value_to_json(value)?);
      }
      Ok(out)
   }

   fn pg_value_to_json(value: PgValueRef) -> Result<JsonValue> {
      if value.is_null() {
         return Ok(JsonValue::Null);
      }

      let column_type = value.type_info();

      let result = match column_type.name() {
         "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            match ValueRef::to_owned(&value).try_decode::<String>() {
               Ok(v) => JsonValue::String(v),
               Err(_) => JsonValue::Null,
            }
         }

         "INT2" => match ValueRef::to_owned(&value).try_decode::<i16>() {
            Ok(v) => JsonValue::Number(i64::from(v).into()),
            Err(_) => JsonValue::Null,
         },

         "INT4" => match ValueRef::to_owned(&value).try_decode::<i32>() {
            Ok(v) => JsonValue::Number(i64::from(v).into()),
            Err(_) => JsonValue::Null,
         },

         "INT8" => match ValueRef::to_owned(&value).try_decode::<i64>() {
            Ok(v) => JsonValue::Number(v.into()),
            Err(_) => JsonValue::Null,
         },

         "FLOAT4" => match ValueRef::to_owned(&value).try_decode::<f32>() {
            Ok(v) => JsonValue::from(f64::from(v)),
            Err(_) => JsonValue::Null,
         },

         "FLOAT8" | "NUMERIC" => match ValueRef::to_owned(&value).try_decode::<f64>() {
            Ok(v) => JsonValue::from(v),
            Err(_) => JsonValue::Null,
         },

         "BOOL" => match ValueRef::to_owned(&value).try_decode::<bool>() {
            Ok(v) => JsonValue::Bool(v),
            Err(_) => JsonValue::Null,
         },

         // JSON columns come back as structured values, not strings
         "JSON" | "JSONB" => match ValueRef::to_owned(&value).try_decode::<JsonValue>() {
            Ok(v) => v,
            Err(_) => JsonValue::Null,
         },

         "BYTEA" => match ValueRef::to_owned(&value).try_decode::<Vec<u8>>() {
            Ok(bytes) => JsonValue::String(base64_encode(&bytes)),
            Err(_) => JsonValue::Null,
         },

         other => {
            if let Ok(text) = ValueRef::to_owned(&value).try_decode::<String>() {
               JsonValue::String(text)
            } else {
               return Err(Error::UnsupportedDatatype(format!(
                  "unknown postgres type: {other}"
               )));
            }
         }
      };

      Ok(result)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_base64_round_trip() {
      assert_eq!(base64_encode(b"hello"), "aGVsbG8=");
      assert_eq!(base64_decode("aGVsbG8=").unwrap(), b"hello");
      assert_eq!(base64_encode(&[]), "");
      assert_eq!(base64_decode("").unwrap(), Vec::<u8>::new());
   }

   #[test]
   fn test_base64_decode_rejects_garbage() {
      let err = base64_decode("not base64!!").unwrap_err();
      assert_eq!(err.error_code(), "CORRUPT_VALUE");
   }
}
