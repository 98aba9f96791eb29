//! Core data model shared by the commit log and the engine pipelines.
//!
//! Scope mappings describe what an actor may read: each scope-key name maps
//! to a single value, a set of values, or the wildcard (everything the actor
//! may see). Changes persist the *extracted* scopes of the mutated row — a
//! flat map of concrete string values — which is what filters match against.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::db::SqlParam;
use crate::dialect::SyncDialect;

/// The partition used when a request names none.
pub const DEFAULT_PARTITION: &str = "default";

/// Maximum length of a partition identifier.
pub const MAX_PARTITION_LEN: usize = 120;

/// Current unix time in milliseconds. All persisted timestamps use this
/// representation for cross-dialect portability.
pub fn now_unix_ms() -> i64 {
   (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Sanitize a partition identifier: characters outside `[A-Za-z0-9._:-]`
/// become `-`, the result is trimmed to 120 characters, and an empty result
/// collapses to `"default"`.
pub fn sanitize_partition_id(raw: &str) -> String {
   let mut out: String = raw
      .chars()
      .map(|c| {
         if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-') {
            c
         } else {
            '-'
         }
      })
      .collect();
   out.truncate(MAX_PARTITION_LEN);
   if out.is_empty() {
      DEFAULT_PARTITION.to_string()
   } else {
      out
   }
}

/// An authorized scope value: one value, a set of values, or everything the
/// actor may see.
///
/// The wildcard is a first-class variant, not a magic string: consumers match
/// on `Wildcard` rather than comparing against `"*"`. On the wire it
/// serializes as the string `"*"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeValue {
   Single(String),
   Many(Vec<String>),
   Wildcard,
}

impl ScopeValue {
   /// Whether this value permits the given concrete scope value.
   pub fn permits(&self, value: &str) -> bool {
      match self {
         ScopeValue::Single(v) => v == value,
         ScopeValue::Many(vs) => vs.iter().any(|v| v == value),
         ScopeValue::Wildcard => true,
      }
   }

   /// The authorization meet of two values, `None` when the result is empty.
   pub fn intersect(&self, other: &ScopeValue) -> Option<ScopeValue> {
      match (self, other) {
         (ScopeValue::Wildcard, v) => Some(v.clone()),
         (v, ScopeValue::Wildcard) => Some(v.clone()),
         (ScopeValue::Single(a), b) => {
            if b.permits(a) {
               Some(ScopeValue::Single(a.clone()))
            } else {
               None
            }
         }
         (ScopeValue::Many(vs), b) => {
            let kept: Vec<String> = vs.iter().filter(|v| b.permits(v)).cloned().collect();
            match kept.len() {
               0 => None,
               1 => Some(ScopeValue::Single(kept.into_iter().next().unwrap())),
               _ => Some(ScopeValue::Many(kept)),
            }
         }
      }
   }
}

impl Serialize for ScopeValue {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      match self {
         ScopeValue::Single(v) => serializer.serialize_str(v),
         ScopeValue::Many(vs) => vs.serialize(serializer),
         ScopeValue::Wildcard => serializer.serialize_str("*"),
      }
   }
}

impl<'de> Deserialize<'de> for ScopeValue {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      #[derive(Deserialize)]
      #[serde(untagged)]
      enum Repr {
         One(String),
         Many(Vec<String>),
      }
      match Repr::deserialize(deserializer)? {
         Repr::One(s) if s == "*" => Ok(ScopeValue::Wildcard),
         Repr::One(s) => Ok(ScopeValue::Single(s)),
         Repr::Many(vs) => Ok(ScopeValue::Many(vs)),
      }
   }
}

/// An ordered mapping from scope-key name to authorized value(s).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeMap(pub IndexMap<String, ScopeValue>);

impl ScopeMap {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
      let mut map = Self::new();
      map.insert(key, ScopeValue::Single(value.into()));
      map
   }

   pub fn wildcard(key: impl Into<String>) -> Self {
      let mut map = Self::new();
      map.insert(key, ScopeValue::Wildcard);
      map
   }

   pub fn insert(&mut self, key: impl Into<String>, value: ScopeValue) {
      self.0.insert(key.into(), value);
   }

   pub fn get(&self, key: &str) -> Option<&ScopeValue> {
      self.0.get(key)
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }

   pub fn iter(&self) -> impl Iterator<Item = (&String, &ScopeValue)> {
      self.0.iter()
   }

   /// Intersect this (authorized) mapping with a client-declared mapping.
   ///
   /// The result carries exactly the authorized keys; a declared key the
   /// resolver did not grant, or a key whose meet is empty, makes the whole
   /// intersection unauthorized (`None`). Declared keys default to wildcard
   /// when absent, so a client that declares nothing gets the full
   /// authorized mapping.
   pub fn intersect(&self, declared: &ScopeMap) -> Option<ScopeMap> {
      for key in declared.0.keys() {
         if !self.0.contains_key(key) {
            return None;
         }
      }
      let mut out = ScopeMap::new();
      for (key, authorized) in &self.0 {
         let requested = declared.0.get(key).unwrap_or(&ScopeValue::Wildcard);
         match authorized.intersect(requested) {
            Some(value) => out.insert(key.clone(), value),
            None => return None,
         }
      }
      Some(out)
   }

   /// Materialize the Cartesian product of concrete bindings.
   ///
   /// `Many` values fan out into one binding per value; `Single` and
   /// `Wildcard` pass through. An empty mapping produces one empty binding
   /// (snapshot over everything in reach of the handler).
   pub fn bindings(&self) -> Vec<ScopeMap> {
      let mut out = vec![ScopeMap::new()];
      for (key, value) in &self.0 {
         match value {
            ScopeValue::Many(vs) => {
               let mut next = Vec::with_capacity(out.len() * vs.len());
               for binding in &out {
                  for v in vs {
                     let mut b = binding.clone();
                     b.insert(key.clone(), ScopeValue::Single(v.clone()));
                     next.push(b);
                  }
               }
               out = next;
            }
            single_or_wildcard => {
               for binding in &mut out {
                  binding.insert(key.clone(), single_or_wildcard.clone());
               }
            }
         }
      }
      out
   }

   /// Canonical JSON text of this mapping, with keys sorted, used for chunk
   /// page keys and cursor bookkeeping.
   pub fn canonical_json(&self) -> String {
      let mut entries: Vec<(&String, &ScopeValue)> = self.0.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      let map: serde_json::Map<String, JsonValue> = entries
         .into_iter()
         .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(JsonValue::Null)))
         .collect();
      JsonValue::Object(map).to_string()
   }
}

impl FromIterator<(String, ScopeValue)> for ScopeMap {
   fn from_iter<T: IntoIterator<Item = (String, ScopeValue)>>(iter: T) -> Self {
      ScopeMap(iter.into_iter().collect())
   }
}

/// The kind of a pushed or persisted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
   Upsert,
   Delete,
}

impl ChangeOp {
   pub fn as_str(self) -> &'static str {
      match self {
         ChangeOp::Upsert => "upsert",
         ChangeOp::Delete => "delete",
      }
   }

   pub fn parse(raw: &str) -> Option<Self> {
      match raw {
         "upsert" => Some(ChangeOp::Upsert),
         "delete" => Some(ChangeOp::Delete),
         _ => None,
      }
   }
}

/// The in-commit change record a handler emits for an applied operation.
///
/// `scopes` are the authoritative extracted scopes of the mutated row: they
/// are persisted on the change row and expanded into fan-out scope keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedChange {
   pub table: String,
   pub row_id: String,
   pub op: ChangeOp,
   pub row_json: Option<JsonValue>,
   pub row_version: Option<i64>,
   pub scopes: IndexMap<String, String>,
}

/// A persisted commit header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
   pub commit_seq: i64,
   pub partition_id: String,
   pub actor_id: String,
   pub client_id: String,
   pub client_commit_id: String,
   pub created_at: i64,
   pub change_count: i64,
   pub affected_tables: Vec<String>,
   pub meta: Option<JsonValue>,
   pub result: Option<JsonValue>,
}

/// A persisted change row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
   pub change_id: i64,
   pub commit_seq: i64,
   pub partition_id: String,
   pub table: String,
   pub row_id: String,
   pub op: ChangeOp,
   pub row_json: Option<JsonValue>,
   pub row_version: Option<i64>,
   pub scopes: IndexMap<String, String>,
}

/// A change joined with its commit header, as produced by incremental pull.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRow {
   pub change: ChangeRecord,
   pub created_at: i64,
   pub actor_id: String,
}

/// A compiled conjunction of scope constraints for SQL filtering.
///
/// Single values become equality on the JSON-extracted scope field, sets
/// become membership, wildcards contribute no constraint. Multiple keys
/// conjunct with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeFilter {
   constraints: Vec<ScopeConstraint>,
}

#[derive(Debug, Clone, PartialEq)]
enum ScopeConstraint {
   Eq(String, String),
   In(String, Vec<String>),
}

impl ScopeFilter {
   /// Compile a scope mapping into a filter.
   pub fn from_scope_map(scopes: &ScopeMap) -> Self {
      let mut constraints = Vec::new();
      for (key, value) in scopes.iter() {
         match value {
            ScopeValue::Single(v) => {
               constraints.push(ScopeConstraint::Eq(key.clone(), v.clone()));
            }
            ScopeValue::Many(vs) => {
               constraints.push(ScopeConstraint::In(key.clone(), vs.clone()));
            }
            ScopeValue::Wildcard => {}
         }
      }
      Self { constraints }
   }

   /// True when the filter matches everything.
   pub fn is_unconstrained(&self) -> bool {
      self.constraints.is_empty()
   }

   /// Render SQL fragments (one per constraint, to be AND-joined) plus the
   /// parameters they bind, starting at placeholder `$next_idx`. Advances
   /// `next_idx` past the consumed placeholders.
   pub fn to_sql(
      &self,
      dialect: SyncDialect,
      scopes_column: &str,
      next_idx: &mut usize,
   ) -> (Vec<String>, Vec<SqlParam>) {
      let mut fragments = Vec::with_capacity(self.constraints.len());
      let mut params = Vec::new();
      for constraint in &self.constraints {
         match constraint {
            ScopeConstraint::Eq(key, value) => {
               let expr = dialect.json_scope_expr(scopes_column, key);
               fragments.push(format!("{expr} = ${}", *next_idx));
               *next_idx += 1;
               params.push(SqlParam::Text(value.clone()));
            }
            ScopeConstraint::In(key, values) => {
               if values.is_empty() {
                  fragments.push("1 = 0".to_string());
                  continue;
               }
               let expr = dialect.json_scope_expr(scopes_column, key);
               if dialect.supports_array_params() {
                  fragments.push(format!("{expr} = ANY(${})", *next_idx));
                  *next_idx += 1;
                  params.push(SqlParam::TextArray(values.clone()));
               } else {
                  let list = dialect.placeholder_list(*next_idx, values.len());
                  fragments.push(format!("{expr} IN ({list})"));
                  *next_idx += values.len();
                  params.extend(values.iter().cloned().map(SqlParam::Text));
               }
            }
         }
      }
      (fragments, params)
   }

   /// Evaluate the filter against extracted scopes in memory. Matches the
   /// SQL semantics: a constrained key missing from the change's scopes does
   /// not match.
   pub fn matches(&self, extracted: &IndexMap<String, String>) -> bool {
      self.constraints.iter().all(|constraint| match constraint {
         ScopeConstraint::Eq(key, value) => extracted.get(key) == Some(value),
         ScopeConstraint::In(key, values) => extracted
            .get(key)
            .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_sanitize_partition_id() {
      assert_eq!(sanitize_partition_id("tenant-1"), "tenant-1");
      assert_eq!(sanitize_partition_id("a b/c"), "a-b-c");
      assert_eq!(sanitize_partition_id(""), "default");
      assert_eq!(sanitize_partition_id("x".repeat(200).as_str()).len(), 120);
      assert_eq!(sanitize_partition_id("us.east:prod_1"), "us.east:prod_1");
   }

   #[test]
   fn test_scope_value_serde() {
      assert_eq!(serde_json::to_value(ScopeValue::Wildcard).unwrap(), json!("*"));
      assert_eq!(
         serde_json::to_value(ScopeValue::Single("a".into())).unwrap(),
         json!("a")
      );
      assert_eq!(
         serde_json::to_value(ScopeValue::Many(vec!["a".into(), "b".into()])).unwrap(),
         json!(["a", "b"])
      );

      assert_eq!(
         serde_json::from_value::<ScopeValue>(json!("*")).unwrap(),
         ScopeValue::Wildcard
      );
      assert_eq!(
         serde_json::from_value::<ScopeValue>(json!("x")).unwrap(),
         ScopeValue::Single("x".into())
      );
      assert_eq!(
         serde_json::from_value::<ScopeValue>(json!(["x"])).unwrap(),
         ScopeValue::Many(vec!["x".into()])
      );
   }

   #[test]
   fn test_scope_value_intersect() {
      let single = |s: &str| ScopeValue::Single(s.into());
      let many = |vs: &[&str]| ScopeValue::Many(vs.iter().map(|s| s.to_string()).collect());

      assert_eq!(
         ScopeValue::Wildcard.intersect(&single("a")),
         Some(single("a"))
      );
      assert_eq!(
         single("a").intersect(&ScopeValue::Wildcard),
         Some(single("a"))
      );
      assert_eq!(single("a").intersect(&single("a")), Some(single("a")));
      assert_eq!(single("a").intersect(&single("b")), None);
      assert_eq!(
         many(&["a", "b", "c"]).intersect(&many(&["b", "c", "d"])),
         Some(many(&["b", "c"]))
      );
      assert_eq!(many(&["a", "b"]).intersect(&single("b")), Some(single("b")));
      assert_eq!(many(&["a"]).intersect(&single("z")), None);
   }

   #[test]
   fn test_scope_map_intersect_rejects_unauthorized_keys() {
      let authorized = ScopeMap::single("user_id", "u1");
      let mut declared = ScopeMap::new();
      declared.insert("share_id", ScopeValue::Single("s1".into()));
      assert_eq!(authorized.intersect(&declared), None);
   }

   #[test]
   fn test_scope_map_intersect_defaults_to_authorized() {
      let authorized = ScopeMap::single("user_id", "u1");
      let effective = authorized.intersect(&ScopeMap::new()).unwrap();
      assert_eq!(effective, ScopeMap::single("user_id", "u1"));
   }

   #[test]
   fn test_scope_map_bindings_cartesian() {
      let mut map = ScopeMap::new();
      map.insert(
         "user_id",
         ScopeValue::Many(vec!["u1".into(), "u2".into()]),
      );
      map.insert("org_id", ScopeValue::Single("o1".into()));
      let bindings = map.bindings();
      assert_eq!(bindings.len(), 2);
      assert_eq!(
         bindings[0].get("user_id"),
         Some(&ScopeValue::Single("u1".into()))
      );
      assert_eq!(
         bindings[1].get("user_id"),
         Some(&ScopeValue::Single("u2".into()))
      );
      assert_eq!(
         bindings[0].get("org_id"),
         Some(&ScopeValue::Single("o1".into()))
      );
   }

   #[test]
   fn test_scope_map_canonical_json_sorts_keys() {
      let mut map = ScopeMap::new();
      map.insert("b", ScopeValue::Single("2".into()));
      map.insert("a", ScopeValue::Wildcard);
      assert_eq!(map.canonical_json(), r#"{"a":"*","b":"2"}"#);
   }

   #[test]
   fn test_scope_filter_sql_sqlite() {
      let mut map = ScopeMap::new();
      map.insert("user_id", ScopeValue::Single("u1".into()));
      map.insert(
         "share_id",
         ScopeValue::Many(vec!["s1".into(), "s2".into()]),
      );
      map.insert("org_id", ScopeValue::Wildcard);

      let filter = ScopeFilter::from_scope_map(&map);
      let mut idx = 3;
      let (fragments, params) = filter.to_sql(SyncDialect::Sqlite, "ch.scopes", &mut idx);

      assert_eq!(
         fragments,
         vec![
            "json_extract(ch.scopes, '$.\"user_id\"') = $3".to_string(),
            "json_extract(ch.scopes, '$.\"share_id\"') IN ($4, $5)".to_string(),
         ]
      );
      assert_eq!(params.len(), 3);
      assert_eq!(idx, 6);
   }

   #[test]
   fn test_scope_filter_sql_postgres_uses_arrays() {
      let mut map = ScopeMap::new();
      map.insert(
         "share_id",
         ScopeValue::Many(vec!["s1".into(), "s2".into()]),
      );
      let filter = ScopeFilter::from_scope_map(&map);
      let mut idx = 1;
      let (fragments, params) = filter.to_sql(SyncDialect::Postgres, "scopes", &mut idx);
      assert_eq!(fragments, vec!["scopes->>'share_id' = ANY($1)".to_string()]);
      assert_eq!(
         params,
         vec![SqlParam::TextArray(vec!["s1".into(), "s2".into()])]
      );
      assert_eq!(idx, 2);
   }

   #[test]
   fn test_scope_filter_matches_in_memory() {
      let mut map = ScopeMap::new();
      map.insert("user_id", ScopeValue::Single("u1".into()));
      let filter = ScopeFilter::from_scope_map(&map);

      let mut extracted = IndexMap::new();
      extracted.insert("user_id".to_string(), "u1".to_string());
      assert!(filter.matches(&extracted));

      extracted.insert("user_id".to_string(), "u2".to_string());
      assert!(!filter.matches(&extracted));

      let empty = IndexMap::new();
      assert!(!filter.matches(&empty));
      assert!(ScopeFilter::default().matches(&empty));
   }

   #[test]
   fn test_empty_set_constraint_matches_nothing() {
      let mut map = ScopeMap::new();
      map.insert("user_id", ScopeValue::Many(vec![]));
      let filter = ScopeFilter::from_scope_map(&map);
      let mut idx = 1;
      let (fragments, params) = filter.to_sql(SyncDialect::Sqlite, "scopes", &mut idx);
      assert_eq!(fragments, vec!["1 = 0".to_string()]);
      assert!(params.is_empty());
   }

   #[test]
   fn test_change_op_round_trip() {
      assert_eq!(ChangeOp::parse("upsert"), Some(ChangeOp::Upsert));
      assert_eq!(ChangeOp::parse("delete"), Some(ChangeOp::Delete));
      assert_eq!(ChangeOp::parse("merge"), None);
      assert_eq!(
         serde_json::to_value(ChangeOp::Upsert).unwrap(),
         json!("upsert")
      );
   }
}
