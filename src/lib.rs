//! Conversational document question answering server - Library exports for testing
//!
//! (c) Softlandia 2025

pub mod api;
pub mod core;
pub mod infrastructure;

#[cfg(test)]
pub(crate) mod test_utils;
