//! Surplus-food pickup service: offer stock, reservations, single-use pickup
//! codes and pickup verification.

pub mod allocator;
pub mod api;
pub mod auth;
pub mod errors;
pub mod extract;
pub mod ledger;
pub mod models;
pub mod queries;
pub mod retry;
pub mod schema;
pub mod seed;
pub mod store;
pub mod sweeper;
#[cfg(test)]
mod test_utils;
pub mod tokens;
pub mod verifier;
