//! Scope patterns and scope-key expansion.
//!
//! A scope pattern is a template like `user:{user_id}` that materializes
//! into a flat scope key (`user:alice`) once its placeholders are bound to
//! concrete values. Flat keys are what the fan-out registry indexes and what
//! the push applier computes from each emitted change.

use indexmap::IndexMap;

use sync_commit_log::{EmittedChange, ScopeMap, ScopeValue};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
   Literal(String),
   Placeholder(String),
}

/// A parsed scope-key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePattern {
   raw: String,
   segments: Vec<Segment>,
}

impl ScopePattern {
   /// Parse a template. Placeholders are `{name}` with a non-empty name;
   /// braces cannot nest.
   pub fn parse(raw: &str) -> Result<Self> {
      let mut segments = Vec::new();
      let mut literal = String::new();
      let mut chars = raw.chars();

      while let Some(c) = chars.next() {
         match c {
            '{' => {
               if !literal.is_empty() {
                  segments.push(Segment::Literal(std::mem::take(&mut literal)));
               }
               let mut name = String::new();
               loop {
                  match chars.next() {
                     Some('}') => break,
                     Some('{') => {
                        return Err(Error::InvalidScopePattern {
                           pattern: raw.to_string(),
                           message: "nested '{'".to_string(),
                        });
                     }
                     Some(c) => name.push(c),
                     None => {
                        return Err(Error::InvalidScopePattern {
                           pattern: raw.to_string(),
                           message: "unterminated placeholder".to_string(),
                        });
                     }
                  }
               }
               if name.is_empty() {
                  return Err(Error::InvalidScopePattern {
                     pattern: raw.to_string(),
                     message: "empty placeholder name".to_string(),
                  });
               }
               segments.push(Segment::Placeholder(name));
            }
            '}' => {
               return Err(Error::InvalidScopePattern {
                  pattern: raw.to_string(),
                  message: "unmatched '}'".to_string(),
               });
            }
            c => literal.push(c),
         }
      }
      if !literal.is_empty() {
         segments.push(Segment::Literal(literal));
      }
      if segments.is_empty() {
         return Err(Error::InvalidScopePattern {
            pattern: raw.to_string(),
            message: "empty pattern".to_string(),
         });
      }

      Ok(Self {
         raw: raw.to_string(),
         segments,
      })
   }

   /// The original template text.
   pub fn raw(&self) -> &str {
      &self.raw
   }

   /// The placeholder names, in template order.
   pub fn placeholder_keys(&self) -> Vec<&str> {
      self
         .segments
         .iter()
         .filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
         })
         .collect()
   }

   /// Substitute extracted scope values into the template. `None` when any
   /// placeholder has no value.
   pub fn materialize(&self, extracted: &IndexMap<String, String>) -> Option<String> {
      let mut out = String::new();
      for segment in &self.segments {
         match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder(name) => out.push_str(extracted.get(name)?),
         }
      }
      Some(out)
   }

   /// Expand the template against an authorized scope mapping, producing one
   /// key per combination of concrete values. Placeholders bound to the
   /// wildcard (or missing entirely) cannot be enumerated and yield nothing.
   pub fn expand(&self, scopes: &ScopeMap) -> Vec<String> {
      let mut keys: Vec<String> = vec![String::new()];
      for segment in &self.segments {
         match segment {
            Segment::Literal(text) => {
               for key in &mut keys {
                  key.push_str(text);
               }
            }
            Segment::Placeholder(name) => {
               let values: Vec<&str> = match scopes.get(name) {
                  Some(ScopeValue::Single(v)) => vec![v.as_str()],
                  Some(ScopeValue::Many(vs)) => vs.iter().map(String::as_str).collect(),
                  Some(ScopeValue::Wildcard) | None => return Vec::new(),
               };
               let mut next = Vec::with_capacity(keys.len() * values.len());
               for key in &keys {
                  for value in &values {
                     let mut k = key.clone();
                     k.push_str(value);
                     next.push(k);
                  }
               }
               keys = next;
            }
         }
      }
      keys
   }
}

/// Expand several patterns against a scope mapping, deduplicated in first-
/// seen order. Used to register a connection under everything its resolved
/// scopes can reach.
pub fn expand_patterns(patterns: &[ScopePattern], scopes: &ScopeMap) -> Vec<String> {
   let mut out: Vec<String> = Vec::new();
   for pattern in patterns {
      for key in pattern.expand(scopes) {
         if !out.contains(&key) {
            out.push(key);
         }
      }
   }
   out
}

/// Compute the fan-out scope keys of a batch of emitted changes: each
/// pattern materialized against each change's extracted scopes,
/// deduplicated in first-seen order.
pub fn scope_keys_for_changes(
   patterns_for_table: impl Fn(&str) -> Vec<ScopePattern>,
   changes: &[EmittedChange],
) -> Vec<String> {
   let mut out: Vec<String> = Vec::new();
   for change in changes {
      for pattern in patterns_for_table(&change.table) {
         if let Some(key) = pattern.materialize(&change.scopes)
            && !out.contains(&key)
         {
            out.push(key);
         }
      }
   }
   out
}

#[cfg(test)]
mod tests {
   use super::*;
   use sync_commit_log::ChangeOp;

   fn extracted(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
      pairs
         .iter()
         .map(|(k, v)| (k.to_string(), v.to_string()))
         .collect()
   }

   #[test]
   fn test_parse_and_materialize() {
      let pattern = ScopePattern::parse("user:{user_id}").unwrap();
      assert_eq!(pattern.placeholder_keys(), vec!["user_id"]);
      assert_eq!(
         pattern.materialize(&extracted(&[("user_id", "alice")])),
         Some("user:alice".to_string())
      );
      assert_eq!(pattern.materialize(&extracted(&[])), None);
   }

   #[test]
   fn test_parse_multi_placeholder() {
      let pattern = ScopePattern::parse("org:{org_id}:team:{team_id}").unwrap();
      assert_eq!(pattern.placeholder_keys(), vec!["org_id", "team_id"]);
      assert_eq!(
         pattern.materialize(&extracted(&[("org_id", "o1"), ("team_id", "t9")])),
         Some("org:o1:team:t9".to_string())
      );
   }

   #[test]
   fn test_parse_rejects_malformed() {
      assert!(ScopePattern::parse("user:{user_id").is_err());
      assert!(ScopePattern::parse("user:}x").is_err());
      assert!(ScopePattern::parse("user:{}").is_err());
      assert!(ScopePattern::parse("a{b{c}}").is_err());
      assert!(ScopePattern::parse("").is_err());
   }

   #[test]
   fn test_expand_against_scope_map() {
      let pattern = ScopePattern::parse("user:{user_id}").unwrap();

      let single = ScopeMap::single("user_id", "u1");
      assert_eq!(pattern.expand(&single), vec!["user:u1"]);

      let mut many = ScopeMap::new();
      many.insert(
         "user_id",
         ScopeValue::Many(vec!["u1".into(), "u2".into()]),
      );
      assert_eq!(pattern.expand(&many), vec!["user:u1", "user:u2"]);

      let wildcard = ScopeMap::wildcard("user_id");
      assert!(pattern.expand(&wildcard).is_empty());
   }

   #[test]
   fn test_scope_keys_for_changes_dedup() {
      let patterns = vec![ScopePattern::parse("user:{user_id}").unwrap()];
      let change = |row: &str, user: &str| EmittedChange {
         table: "tasks".into(),
         row_id: row.into(),
         op: ChangeOp::Upsert,
         row_json: None,
         row_version: Some(1),
         scopes: extracted(&[("user_id", user)]),
      };
      let changes = vec![change("t1", "u1"), change("t2", "u1"), change("t3", "u2")];
      let keys = scope_keys_for_changes(|_| patterns.clone(), &changes);
      assert_eq!(keys, vec!["user:u1", "user:u2"]);
   }
}
