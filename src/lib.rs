//! # docsift
//!
//! Ingests free-form documents and source-code repositories into a vector
//! collection and serves semantic search over them, with every result
//! attributed to the file it came from.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────┐   ┌────────────┐
//! │ documents/   │──▶│ Pipeline              │──▶│ Collection │
//! │ code/<repo>/ │   │ extract→chunk→embed   │   │ (SQLite)   │
//! └──────────────┘   └───────────────────────┘   └─────┬──────┘
//!                                                      │
//!                          ┌───────────────────────────┤
//!                          ▼                           ▼
//!                     ┌──────────┐              ┌────────────┐
//!                     │   CLI    │              │    HTTP    │
//!                     │ (search) │              │ /tools/... │
//!                     └──────────┘              └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docsift init                      # create schema and collection
//! docsift ingest                    # documents root + every code repository
//! docsift search "retry backoff" --kind code
//! docsift get notes/design.md       # stored chunks and rebuilt text
//! docsift serve                     # POST /tools/search
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`error`] | Typed error taxonomy |
//! | [`models`] | Sources, chunks, records, results |
//! | [`discover`] | Walking the documents and code roots |
//! | [`extract`] | Bytes to normalized text (UTF-8, PDF, OOXML) |
//! | [`chunk`] | Overlapping chunker and reconstruction |
//! | [`chunk_code`] | Definition boundaries via tree-sitter |
//! | [`embedding`] | `Embedder` trait, providers, batching |
//! | [`retry`] | Bounded exponential backoff |
//! | [`store`] | `CollectionStore` trait, SQLite and in-memory backends |
//! | [`fingerprint`] | Per-path content fingerprints |
//! | [`ingest`] | Concurrent ingestion pipelines |
//! | [`search`] | Retrieval service |
//! | [`get`] | Stored chunks of one source |
//! | [`stats`] | Collection statistics |
//! | [`progress`] | Ingest progress on stderr |
//! | [`server`] | HTTP endpoint |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema creation |

pub mod chunk;
pub mod chunk_code;
pub mod config;
pub mod db;
pub mod discover;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retry;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
