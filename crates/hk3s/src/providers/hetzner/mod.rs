//! Hetzner Cloud provider.
//!
//! Implements the [`CloudProvider`](crate::providers::CloudProvider) trait
//! for the Hetzner Cloud API (`https://api.hetzner.cloud/v1`).
//!
//! ## Resources
//!
//! Networks, firewalls, SSH keys, placement groups, load balancers,
//! servers and locations. Every lookup is by name; listings follow
//! `meta.pagination.next_page` until it is empty.

mod client;
mod models;

pub use client::HetznerCloud;
pub use models::*;
