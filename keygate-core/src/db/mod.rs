//! Database module for Keygate
//!
//! Contains the user entity and its read-only repository.

pub mod user;

pub use user::{UserAccount, UserRepository};
