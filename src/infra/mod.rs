//! Infrastructure layer for the AS2 gateway
//!
//! Contains trait definitions and implementations for:
//! - Persistence (SQLite)
//! - Audit logging (partner, certificate and message operations)
//! - Retry with exponential backoff

mod audit;
mod error;
mod retry;
pub mod sqlite;
mod traits;

pub use audit::{
    parse_audit_action, AuditAction, AuditLogBuilder, AuditLogEntry, AuditQueryFilters,
    RetryingAuditSink, SqliteAuditLog,
};
pub use error::*;
pub use retry::{Retry, RetryConfig, RetryResult};
pub use sqlite::{InboundFilter, MessageFilter, MessageUpdate, SqliteStore};
pub use traits::*;
