//! Client for a remote scanned-page to eBook conversion service.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
