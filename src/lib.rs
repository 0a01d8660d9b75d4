// SPDX-License-Identifier: MPL-2.0

//! PiTV - camera streaming server
//!
//! Captures H.264 video from a camera, records it into rolling time-split MP4
//! fragments under a size quota, and streams RTP over UDP to viewers that hold
//! a time-limited lease obtained from an authenticated HTTP control plane.
//!
//! # Architecture
//!
//! - [`pipeline`]: live media graph engine (capture, fan-out, recording, egress)
//! - [`lease`]: per-user camera leases with expiry
//! - [`server`]: HTTP/HTTPS control plane
//! - [`accounts`]: credential store
//! - [`stats`]: host load and temperature
//! - [`config`]: command line and file configuration
//! - [`driver`]: startup, event loop, reload and shutdown

pub mod accounts;
pub mod config;
pub mod constants;
pub mod control;
pub mod driver;
pub mod errors;
pub mod lease;
pub mod logging;
pub mod net;
pub mod pipeline;
pub mod server;
pub mod stats;

pub use config::{Cli, Settings};
pub use errors::{AppError, LeaseError, PipelineError};
pub use pipeline::Pipeline;
