//! Domain layer containing core types, collaborator traits, and error
//! definitions.

pub mod accounts;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, ChainError, ConfigError, ErrorKind, StoreError};
pub use traits::{AccountFilter, ChainClient, LogEvent, MpcTrigger};
pub use types::{
    CrankStatus, EndpointStatus, LockRecord, OperationStatus, OperationType, PendingOperation,
    ProcessedRequest, ProcessorStatus, RequestStatus, RequestType, TransactionRecord, TxStatus,
    WorkItem, lock_names, operation_key,
};
