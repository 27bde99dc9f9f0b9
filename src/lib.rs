#![deny(unsafe_code)]

//! Wax: an embedded, single-file, on-device memory store for AI agents.
//!
//! A container (`.mv2s`) holds an append-only frame log behind a dual-buffered header/WAL/TOC
//! commit protocol (see [`container`]), with a BM25 text index, an ANN vector index, and a
//! bitemporal structured-fact store layered on top (see [`textindex`], [`vectorindex`],
//! [`structured`]). [`orchestrator::Orchestrator`] is the primary entry point: it owns a
//! [`session::Session`] behind a serial executor and exposes `remember`/`recall`/`flush`.

pub mod buildinfo;
pub mod checksum;
pub mod cli;
pub mod codec;
pub mod compressor;
pub mod config;
pub mod container;
pub mod embedding_cache;
pub mod errors;
pub mod fileio;
pub mod frame;
pub mod orchestrator;
pub mod providers;
pub mod rag;
pub mod search;
pub mod session;
pub mod structured;
pub mod textindex;
pub mod utils;
pub mod vectorindex;
pub mod wal;

pub use errors::{Result, WaxError};
pub use orchestrator::Orchestrator;
pub use session::SessionMode;
