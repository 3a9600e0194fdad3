//! In-memory stand-ins for the GPU blocks the core drives.

pub mod memory;
pub mod pbdma;
pub mod regs;
pub mod syncpt;

pub use memory::HostMemory;
pub use pbdma::GpfifoEntry;
pub use regs::GpuHw;
pub use syncpt::SyncpointManager;
