//! Building blocks for the Beach peer cache.
//!
//! A [`group::Group`] answers lookups from its local [`store::LruStore`] and,
//! on a miss, funnels every concurrent caller for the same key through one
//! [`flight::Flight`] execution that either runs the group's backing loader or
//! asks the owning peer. Peer processes find each other through a
//! [`coordination::CoordinationStore`], where each node keeps a leased
//! endpoint alive with [`lease::KeepAlive`].
//!
//! Transport lives in the `beach-cache` service; this crate only depends on
//! the [`group::Fetcher`] seam.

pub mod byte_view;
pub mod coordination;
pub mod error;
pub mod flight;
pub mod group;
pub mod lease;
pub mod placement;
pub mod store;

pub use byte_view::ByteView;
pub use error::{CacheError, DiscoveryError, FetchError, LoadError};
