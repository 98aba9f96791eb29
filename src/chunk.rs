//! Content-addressed snapshot chunks for bootstrap delivery.
//!
//! Small row batches are embedded inline in the pull response; larger ones
//! are encoded once (canonical JSON array, optionally gzipped), hashed, and
//! persisted as an immutable, TTL-bounded chunk the client fetches out of
//! band. The chunk id is derived from the page key and the body hash, so
//! identical inputs produce identical ids and concurrent producers of the
//! same page deduplicate through the store's page-key index.

use std::io::Write;

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use sync_commit_log::store::ChunkRecord;
use sync_commit_log::{CommitLogStore, now_unix_ms};

use crate::error::{Error, Result};
use crate::protocol::SnapshotPage;

/// Encoding of chunk bodies. Only canonical JSON today.
pub const ENCODING_JSON: &str = "json";

/// Compression applied to persisted chunk bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkCompression {
   None,
   #[default]
   Gzip,
}

impl ChunkCompression {
   pub fn as_str(self) -> &'static str {
      match self {
         ChunkCompression::None => "none",
         ChunkCompression::Gzip => "gzip",
      }
   }

   pub fn parse(raw: &str) -> Option<Self> {
      match raw {
         "none" => Some(ChunkCompression::None),
         "gzip" => Some(ChunkCompression::Gzip),
         _ => None,
      }
   }
}

/// Chunker configuration.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
   /// Bootstrap retention window: chunks expire this long after creation
   /// and are not refreshed on read.
   ///
   /// Default: 1 hour.
   pub ttl_ms: i64,

   /// Row batches whose canonical encoding is at most this many bytes are
   /// returned inline instead of being persisted.
   ///
   /// Default: 16 KiB.
   pub inline_max_bytes: usize,

   /// Compression for persisted bodies.
   pub compression: ChunkCompression,
}

impl Default for ChunkerConfig {
   fn default() -> Self {
      Self {
         ttl_ms: 3_600_000,
         inline_max_bytes: 16 * 1024,
         compression: ChunkCompression::Gzip,
      }
   }
}

/// Identity of one snapshot page.
#[derive(Debug, Clone)]
pub struct PageSpec<'a> {
   pub partition_id: &'a str,
   pub scope_key: &'a str,
   /// Canonical JSON of the scope binding.
   pub scope_json: &'a str,
   pub as_of_commit_seq: i64,
   pub row_cursor: &'a str,
   pub row_limit: i64,
}

/// A fetched chunk body, as streamed by the chunk endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkBody {
   pub chunk_id: String,
   pub body: Vec<u8>,
   pub encoding: String,
   pub compression: String,
   pub sha256: String,
   pub byte_length: i64,
}

/// Builds, persists, and serves snapshot chunks.
#[derive(Debug, Clone)]
pub struct SnapshotChunker {
   store: CommitLogStore,
   config: ChunkerConfig,
}

impl SnapshotChunker {
   pub fn new(store: CommitLogStore, config: ChunkerConfig) -> Self {
      Self { store, config }
   }

   pub fn config(&self) -> &ChunkerConfig {
      &self.config
   }

   /// Turn one snapshot page into its response form: inline rows when
   /// small, otherwise a persisted chunk reference.
   pub async fn produce_page(
      &self,
      spec: PageSpec<'_>,
      table: &str,
      rows: Vec<JsonValue>,
      next_row_cursor: Option<String>,
   ) -> Result<SnapshotPage> {
      let encoded = serde_json::to_vec(&rows)?;
      if encoded.len() <= self.config.inline_max_bytes {
         trace!(table, rows = rows.len(), bytes = encoded.len(), "inline snapshot page");
         return Ok(SnapshotPage {
            table: table.to_string(),
            rows: Some(rows),
            chunk_id: None,
            byte_length: None,
            sha256: None,
            next_row_cursor,
         });
      }

      let (body, compression) = match self.config.compression {
         ChunkCompression::None => (encoded, ChunkCompression::None),
         ChunkCompression::Gzip => (gzip_compress(&encoded)?, ChunkCompression::Gzip),
      };
      let body_sha = hex_sha256(&body);
      let chunk_id = derive_chunk_id(&spec, compression, &body_sha);
      let now = now_unix_ms();

      let record = ChunkRecord {
         chunk_id,
         partition_id: spec.partition_id.to_string(),
         scope_key: spec.scope_key.to_string(),
         scope: spec.scope_json.to_string(),
         as_of_commit_seq: spec.as_of_commit_seq,
         row_cursor: spec.row_cursor.to_string(),
         row_limit: spec.row_limit,
         encoding: ENCODING_JSON.to_string(),
         compression: compression.as_str().to_string(),
         sha256: body_sha,
         byte_length: body.len() as i64,
         body,
         blob_hash: None,
         created_at: now,
         expires_at: now + self.config.ttl_ms,
      };

      // Two producers of the same page key are interchangeable: the insert
      // ignores a pre-existing row and the stored one is what we reference.
      let stored = self.store.insert_chunk_if_absent(&record).await?;
      debug!(
         chunk_id = %stored.chunk_id,
         table,
         bytes = stored.byte_length,
         "snapshot page chunked"
      );

      Ok(SnapshotPage {
         table: table.to_string(),
         rows: None,
         chunk_id: Some(stored.chunk_id),
         byte_length: Some(stored.byte_length),
         sha256: Some(stored.sha256),
         next_row_cursor,
      })
   }

   /// The stored body for the chunk-fetch endpoint. Missing and expired
   /// chunks are indistinguishable to the client.
   pub async fn fetch_chunk(&self, chunk_id: &str) -> Result<ChunkBody> {
      let record = self
         .store
         .get_chunk(chunk_id, now_unix_ms())
         .await?
         .ok_or_else(|| Error::ChunkNotFound(chunk_id.to_string()))?;
      Ok(ChunkBody {
         chunk_id: record.chunk_id,
         body: record.body,
         encoding: record.encoding,
         compression: record.compression,
         sha256: record.sha256,
         byte_length: record.byte_length,
      })
   }

   /// Decode a fetched body back into rows (what a client does after
   /// verifying the hash).
   pub fn decode_body(body: &ChunkBody) -> Result<Vec<JsonValue>> {
      let raw = match ChunkCompression::parse(&body.compression) {
         Some(ChunkCompression::None) => body.body.clone(),
         Some(ChunkCompression::Gzip) => gzip_decompress(&body.body)?,
         None => {
            return Err(Error::Other(format!(
               "unknown chunk compression: {}",
               body.compression
            )));
         }
      };
      Ok(serde_json::from_slice(&raw)?)
   }

   /// Delete chunks past their retention window.
   pub async fn sweep_expired(&self) -> Result<u64> {
      Ok(self.store.delete_expired_chunks(now_unix_ms()).await?)
   }
}

fn derive_chunk_id(spec: &PageSpec<'_>, compression: ChunkCompression, body_sha: &str) -> String {
   let mut hasher = Sha256::new();
   hasher.update(spec.partition_id.as_bytes());
   hasher.update([0x1f]);
   hasher.update(spec.scope_key.as_bytes());
   hasher.update([0x1f]);
   hasher.update(spec.scope_json.as_bytes());
   hasher.update([0x1f]);
   hasher.update(spec.as_of_commit_seq.to_be_bytes());
   hasher.update(spec.row_cursor.as_bytes());
   hasher.update([0x1f]);
   hasher.update(spec.row_limit.to_be_bytes());
   hasher.update(ENCODING_JSON.as_bytes());
   hasher.update([0x1f]);
   hasher.update(compression.as_str().as_bytes());
   hasher.update([0x1f]);
   hasher.update(body_sha.as_bytes());
   hex::encode(hasher.finalize())
}

fn hex_sha256(data: &[u8]) -> String {
   let mut hasher = Sha256::new();
   hasher.update(data);
   hex::encode(hasher.finalize())
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
   let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
   encoder
      .write_all(data)
      .and_then(|_| encoder.finish())
      .map_err(|e| Error::Other(format!("gzip encode failed: {e}")))
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
   use std::io::Read;
   let mut decoder = flate2::read::GzDecoder::new(data);
   let mut out = Vec::new();
   decoder
      .read_to_end(&mut out)
      .map_err(|e| Error::Other(format!("gzip decode failed: {e}")))?;
   Ok(out)
}
