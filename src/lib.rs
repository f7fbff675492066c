//! # evidence-index
//!
//! An incremental embedding and vector-indexing pipeline for evidence-backed
//! retrieval.
//!
//! evidence-index takes the chunk records produced by an upstream
//! parse/segment step, embeds only new or changed content through a remote,
//! rate-limited provider, and maintains a SQLite-backed vector store that
//! always mirrors the current input set — surviving throttling, partial
//! failures, and multi-hour runs without losing completed work.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────┐   ┌─────────────────┐   ┌──────────┐
//! │ chunks.jsonl │──▶│ Hash Diff │──▶│ Adaptive Pool    │──▶│  SQLite   │
//! │ (segmenter)  │   │  Engine   │   │ Embed Executor  │   │ vectors  │
//! └─────────────┘   └───────────┘   └─────────────────┘   └────┬─────┘
//!                         │   reuse (no provider calls)        │
//!                         └──────────────────────────────▶ checkpointed
//!                                                            batch writes
//! ```
//!
//! Progress goes to stderr and a latest-wins status snapshot; chunks that
//! exhaust their retries land in a durable failure ledger instead of
//! failing the run.
//!
//! ## Quick Start
//!
//! ```bash
//! evi init                      # directories, default config, schema
//! evi index                     # embed new/changed chunks into the store
//! evi index --dry-run           # show the diff without embedding
//! evi search "mediation effect" # cosine-ranked, citable-only results
//! evi stats                     # store overview
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`sources`] | Chunk record loading |
//! | [`diff`] | Content-hash reuse/recompute partitioning |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`executor`] | Adaptive concurrent embedding executor |
//! | [`indexer`] | Checkpointed run controller |
//! | [`store`] | SQLite vector store |
//! | [`search`] | Semantic search |
//! | [`report`] | Progress, status snapshot, failure ledger |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod diff;
pub mod embedding;
pub mod errors;
pub mod executor;
pub mod indexer;
pub mod migrate;
pub mod models;
pub mod report;
pub mod search;
pub mod sources;
pub mod stats;
pub mod store;
