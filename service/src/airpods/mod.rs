//! Apple proximity-pairing support.
//!
//! This module contains the advertisement protocol, the capability table of
//! known models, advertiser arbitration, per-model decoding and the
//! per-headset session that ties them together.

pub mod arbiter;
pub mod decoder;
pub mod metadata;
pub mod models;
pub mod parser;
pub mod protocol;
pub mod recognition;
pub mod session;
