//! Channel, submission and GMMU core for GK20A/GM20B class GPUs.
//!
//! The hardware side is modelled in host memory (see [`hw`]), so every
//! protocol in the crate (refcounting, gpfifo publication, fences, page
//! table updates, runlist construction and recovery) runs without a GPU.

pub mod channel;
pub mod config;
pub mod context;
pub mod debug;
pub mod error;
pub mod fifo;
pub mod hw;
pub mod mm;
pub mod sync;
pub mod utils;

pub use config::GpuConfig;
pub use context::DeviceContext;
pub use error::{GpuError, GpuResult};
