//! Bluetooth layer for headset sessions.
//!
//! This module provides adapter management, headset discovery and the LE
//! scanners that feed advertisements into sessions.

pub mod manager;
pub mod scanner;
