//! Core infrastructure shared by every stage of an install
//!
//! Home layout, platform detection, file locking and terminal output.

pub mod config;
pub mod lock;
pub mod output;
pub mod platform;
pub mod version_cmp;
