//! Application layer: the lock service, the generic processor, the concrete
//! job families, and the crank composition root.

pub mod crank;
pub mod jobs;
pub mod lock;
pub mod processor;

pub use crank::{CrankConfig, CrankService, MaintenanceReport};
pub use lock::{AcquireOptions, LockHandle, LockService, LockServiceConfig};
pub use processor::{JobFamily, PollProcessor, ProcessorConfig};
