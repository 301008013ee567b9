//! Article storage, overview and history core for an INN-style news
//! transit node.
//!
//! Three independently addressable indices over the same article stream:
//!
//! - [`storage`] -- content-addressed storage behind an opaque [`token`],
//!   dispatched to a backend by the token's first byte ([`storage::TimehashBackend`]
//!   is the only backend today).
//! - [`overview`] -- per-newsgroup sequences of (article-number -> token)
//!   records, backed by fixed-size blocks in a shared arena
//!   ([`overview::buffindexed`]).
//! - [`history`] -- a message-ID -> token hash index ([`history::Dbz`])
//!   guarding against duplicate injection and serving direct lookups.
//!
//! [`context::SystemContext`] ties the three together with loaded
//! configuration ([`config`]) and exposes the high-level injection/cancel
//! operations used by a server process; [`article`] supplies the header
//! parsing and Xref bookkeeping that glues wire-format article bytes to
//! the indices. [`canlock`] and [`nntp`] are protocol-adjacent concerns
//! (RFC 8315 Cancel-Lock, and the CRLF/dot-stuffed line framer) that don't
//! depend on any of the above.

pub mod article;
pub mod canlock;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod nntp;
pub mod overview;
pub mod storage;
pub mod token;
pub mod tools;

pub use context::SystemContext;
pub use error::{Error, Fatal};
pub use token::Token;
