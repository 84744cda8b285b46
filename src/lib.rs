//! # Gatehouse (request security gate)
//!
//! `gatehouse` is the layer every API call passes before business logic runs.
//! It combines three checks, always in this order:
//!
//! - **Rate limiting:** fixed-window counters per route class and client,
//!   kept in a shared store with a single atomic upsert per request. Store
//!   outages fail open.
//! - **Session gate:** HMAC-signed session tokens resolved into a
//!   `Principal`. Routes may require a *verified* principal; verification is a
//!   two-state enum and only a literal `true` ever verifies.
//! - **CSRF:** double-submit tokens for unsafe methods, compared in constant
//!   time. Every failure reason collapses into one generic 403.
//!
//! Token and counter persistence goes through the `store::TokenStore` trait
//! (`PostgreSQL` or in-memory).

pub mod api;
pub mod cli;
pub mod gate;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
