//! Protomesh Mesh Engine
//!
//! Config synthesis and distribution for non-HTTP service mesh protocols:
//! - protocol generators turning service descriptors into listener patches
//! - route synthesis from routing intent to wire-level route tables
//! - a reconciler converging generated patches against a patch store
//! - a streaming distribution server pushing route tables to proxies
//! - a virtual IP allocator for address-less services
//!
//! # Architecture
//!
//! - `model` - mesh resources as read from the config store
//! - `store` - config store surface and the in-memory store
//! - `xds` - route table and filter types proxies consume
//! - `route` - route synthesis
//! - `generator` - protocol generators and the protocol registry
//! - `reconciler` - debounced generate, diff and apply loop
//! - `server` / `grpc` - route distribution over the aggregated discovery stream
//! - `vip` - virtual IP allocation

pub mod backend;
pub mod debounce;
pub mod generator;
pub mod grpc;
pub mod index;
pub mod model;
pub mod patch;
pub mod ratelimit;
pub mod reconciler;
pub mod route;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod vip;
pub mod xds;

// Re-export commonly used types
pub use backend::{MemoryPatchStore, PatchStore};
pub use debounce::DebounceConfig;
pub use generator::{GeneratorRegistry, MeshSettings, ProtocolRegistry};
pub use grpc::{AdsServer, AdsService};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use server::{DistributionConfig, DistributionServer, SnapshotScope};
pub use snapshot::{RouteSnapshot, SnapshotCache};
pub use store::{ConfigStore, MemoryConfigStore};
pub use vip::{ExhaustionPolicy, VipAllocator, VipController};
