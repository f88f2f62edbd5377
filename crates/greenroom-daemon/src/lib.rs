//! HTTP and duplex gateway for the greenroom backend.
//!
//! The daemon exposes the REST surface, the per-session WebSocket stream,
//! and the media upload endpoint. All domain behavior lives in
//! `greenroom-core`; this crate routes requests, enforces the per-endpoint
//! capability audience, validates bodies, and maps component errors onto the
//! wire taxonomy.

pub mod gateway;
