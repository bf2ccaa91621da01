//! k3s on the cluster's servers: install scripts, staged bootstrap and
//! in-place upgrades.

pub mod bootstrap;
pub mod scripts;
pub mod upgrade;

pub use bootstrap::Bootstrapper;
