//! # syndicate-ug
//!
//! The User Gateway (UG) core of a Syndicate volume: the subsystem that
//! presents a coherent, versioned POSIX-like file interface whose
//! authoritative metadata lives on a remote metadata service (MS) and whose
//! bulk data is spread across peer gateways and replica gateways (RGs).
//!
//! ## Architecture
//!
//! Five components, built bottom-up:
//! - [`block`]: the pure block-alignment function and the dirty-block state
//!   machine (`empty -> ram-only -> flushing -> on-disk -> mmaped`).
//! - [`inode`]: per-open-file manifest, dirty-block map, freshness
//!   bookkeeping, and FIFO sync queue.
//! - [`consistency`]: path/manifest freshness and coordinator handoff.
//! - [`read_path`] / [`write_path`]: the seven-phase read algorithm and the
//!   merge-then-commit write algorithm, including remote patch-manifest.
//! - [`replication`]: the 4-phase flush/vacuum-log/fan-out/MS-update state
//!   machine.
//! - [`vacuum`]: per-inode fsync serialization and vacuum-log reclamation.
//!
//! [`manifest`], [`cert`], [`xattr`], [`transport`], [`cache`], [`ids`] and
//! [`error`] are the data model and collaborator seams those five components
//! share. [`gateway`] wires everything into one [`UserGateway`] handle that
//! a gateway binary (e.g. `gatewayctl`) links and drives.
//!
//! The MS RPC client, the on-disk block cache's real backing store, the
//! generic download-loop driver, the HTTP server, the storage "driver" that
//! serializes chunks, the fs-name namespace layer, and the gateway
//! bootstrap/config-reload loop are external collaborators out of scope for
//! this crate; they are modeled here as traits ([`cache::DiskCache`],
//! [`transport::GatewayClient`], [`transport::MsClient`], [`vacuum::Vacuumer`])
//! with reference implementations usable for tests and standalone operation.

pub mod block;
pub mod cache;
pub mod cert;
pub mod config;
pub mod consistency;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod inode;
pub mod logging;
pub mod manifest;
pub mod read_path;
pub mod replication;
pub mod transport;
pub mod vacuum;
pub mod write_path;
pub mod xattr;

pub use crate::config::Config;
pub use crate::error::{GatewayError, Result};
pub use crate::gateway::UserGateway;
