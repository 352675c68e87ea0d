//! Job lifecycle: submission, status polling and the page-at-a-time flow.

pub mod error;
pub mod pages;
pub mod polling;
pub mod service;
pub mod session;

#[cfg(test)]
mod testing;
