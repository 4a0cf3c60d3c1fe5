//! `udp-traffic` — a UDP load-generation and loss/latency-measurement engine.
//!
//! The engine pushes a configurable rate of UDP probes through a device under
//! test, observes which probes are echoed back, and periodically ships
//! per-second delivery statistics to a remote controller.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  probe datagrams   ┌────────────────┐
//!  │TrafficEngine │───────────────────▶│ echo responder │
//!  │ (rate loop)  │◀───────────────────│   (external)   │
//!  └──┬───────┬───┘  echoed replies    └────────────────┘
//!     │       │
//!     │       │ one socket per probe
//!     │  ┌────▼─────────┐   readiness    ┌──────────────┐
//!     │  │ ReplyTracker │◀───────────────│ ReplyReactor │
//!     │  │ (seq → entry)│  stamps recv   │ (epoll/poll) │
//!     │  └────┬─────────┘                └──────────────┘
//!     │       │ bucket closes after grace period
//!     │  ┌────▼─────────┐   StatRecord   ┌──────────────┐
//!     └─▶│  BucketRing  │───────────────▶│ StatReporter │──▶ controller
//!        │ (per-second) │                │ (5s batches) │    (HTTP POST)
//!        └──────────────┘                └──────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`config`]   — engine configuration and validation
//! - [`socket`]   — per-probe non-blocking UDP socket wrapper
//! - [`tracker`]  — sequence-number → pending-probe bookkeeping
//! - [`bucket`]   — per-second bucket ring with grace-delayed closure
//! - [`stats`]    — bucket finalization into controller stat records
//! - [`reactor`]  — reply readiness detection (edge-triggered or polling)
//! - [`reporter`] — periodic stat delivery to the controller
//! - [`engine`]   — the rate-controlled send loop and lifecycle control

pub mod bucket;
pub mod config;
pub mod engine;
pub mod reactor;
pub mod reporter;
pub mod socket;
pub mod stats;
pub mod tracker;

pub use config::EngineConfig;
pub use engine::{EngineError, EngineHandle, TrafficEngine};
pub use stats::StatRecord;
