//! Domain logic for the greenroom mock-interview backend.
//!
//! The crate is organized around the three load-bearing pieces of the
//! platform:
//!
//! - the **session lifecycle and token authority** ([`session`], [`token`],
//!   [`lifecycle`]): sessions move through
//!   `PendingPrecheck -> Ready -> Active -> Paused -> Completed/Ended`, and
//!   every phase is authorized by a narrowly scoped, short-lived capability
//!   token;
//! - the **anti-cheat event chain** ([`chain`], [`anticheat`], [`policy`]): a
//!   strictly monotonic, hash-linked per-session log of browser-reported
//!   environment events, with a declarative strike policy driving
//!   auto-pause/auto-end;
//! - the **AI proxy and live fan-out** ([`ai`], [`fanout`]): next-question and
//!   summary requests are proxied to an external provider (with a
//!   deterministic local fallback) and every resulting record is pushed to
//!   per-session subscribers in publish order.
//!
//! [`service`] ties the components together and is the only module that holds
//! the per-session write lock across store, lifecycle, and proxy calls. The
//! HTTP surface lives in the `greenroom-daemon` crate; nothing in this crate
//! depends on axum.

pub mod ai;
pub mod anticheat;
pub mod chain;
pub mod codeeval;
pub mod config;
pub mod fanout;
pub mod lifecycle;
pub mod policy;
pub mod service;
pub mod session;
pub mod store;
pub mod token;

pub use config::Config;
pub use service::SessionService;
