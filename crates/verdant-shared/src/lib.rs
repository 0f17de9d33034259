//! # Verdant Shared
//!
//! Wire types for the job worker's monitoring surface.
//! Kept free of server dependencies so dashboards can reuse them.

pub mod dto;
pub mod response;

pub use response::{ApiResponse, ErrorResponse};
