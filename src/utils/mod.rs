//! Shared process plumbing.

pub mod bootstrap;
pub mod retry;
