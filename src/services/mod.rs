//! Ambient proxy services (§4.8, §4.9): named [`crate::composite::Service`]s
//! wrapping a small persistent or in-memory store, dispatched through the
//! same Reply-callback contract every service uses.

pub mod counter;
pub mod packet_cache;
