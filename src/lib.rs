//! # crm-rag
//!
//! Retrieval-augmented chat over uploaded documents and HubSpot CRM records,
//! with a Messenger channel that answers each linked contact from their own
//! records only.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Files / CRM │──▶│   Pipeline   │──▶│ SQLite index │
//! │  loaders    │   │ Chunk+Embed  │   │  (vectors)   │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                       ┌─────────────────────┤
//!                       ▼                     ▼
//!                  ┌──────────┐        ┌─────────────┐
//!                  │   CLI    │        │   Webhook   │
//!                  │  (crag)  │        │ (Messenger) │
//!                  └──────────┘        └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! crag init                          # create the local stores
//! crag ingest files ./docs           # index PDFs, Markdown, text
//! crag ingest crm                    # or: index HubSpot records
//! crag ask "which deals close this quarter?"
//! crag link <psid> <contact_id>      # bind a Messenger user to a contact
//! crag serve webhook                 # answer Messenger users
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`error`] | Typed errors and corruption detection |
//! | [`models`] | Core data types |
//! | [`chunk`] | Recursive text splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Chat model abstraction |
//! | [`filter`] | Typed metadata filters |
//! | [`store`] | Vector index trait and SQLite backend |
//! | [`lifecycle`] | Index load, probe, discard, recreate |
//! | [`ingest`] | Batched ingestion with replace semantics |
//! | [`loaders`] | PDF / Markdown / text file loading |
//! | [`hubspot`] | HubSpot client and record rendering |
//! | [`crm_cache`] | Local cache of CRM records |
//! | [`retrieval`] | Unscoped and contact-scoped retrieval |
//! | [`answer`] | Grounded answer generation |
//! | [`cache`] | Process-wide index cache |
//! | [`identity`] | Identity links and message history |
//! | [`messenger`] | Outbound delivery and signature checks |
//! | [`webhook`] | Messenger webhook server |
//! | [`status`] | Health overview |

pub mod answer;
pub mod backoff;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod crm_cache;
pub mod db;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod hubspot;
pub mod identity;
pub mod ingest;
pub mod lifecycle;
pub mod llm;
pub mod loaders;
pub mod messenger;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retrieval;
pub mod status;
pub mod store;
pub mod webhook;
