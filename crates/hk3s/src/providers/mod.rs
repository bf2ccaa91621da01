//! Cloud provider abstraction.

pub mod hetzner;
pub mod traits;

pub use traits::*;
