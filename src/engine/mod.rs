//! Outbound transmission engine
//!
//! - `state_machine`: submit, dispatch, MDN reconciliation, cancel
//! - `scheduler`: retry decisions and the background worker
//! - `registry`: partner and certificate administration
//! - `locks`: one in-process writer per message
//! - `clock`: injectable time source

mod clock;
mod locks;
mod registry;
mod scheduler;
mod state_machine;

pub use clock::{Clock, ManualClock, SystemClock};
pub use locks::{MessageGuard, MessageLocks};
pub use registry::{CertificateSpec, CertificateView, PartnerRegistry};
pub use scheduler::{
    retry_decision, RetryDecision, RetryWorker, RetryWorkerConfig, TickReport, WorkerMessage,
};
pub use state_machine::{CancelOutcome, EngineConfig, MdnReceipt, TransmissionEngine};
