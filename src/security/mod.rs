//! Security primitives applied to every sandboxed command
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 1: CAPABILITIES                                          │
//! │  Shrink the bounding set so nothing exec'd can regain           │
//! │  CAP_SYS_ADMIN, CAP_NET_RAW, CAP_SETUID, ...                    │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 2: SECCOMP BPF (only when networking is disabled)        │
//! │                                                                 │
//! │  socket(AF_INET*) ──► Filter ──► EACCES                         │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                        exec(command)
//! ```
//!
//! Both layers run in the forked child (`pre_exec`), in this order.
//! Resource limits are a separate concern, see [`crate::cgroups`].

pub mod capabilities;
pub mod seccomp;

pub use capabilities::{can_drop_bounding, CapabilityDropper};
pub use seccomp::NetworkSeccomp;
