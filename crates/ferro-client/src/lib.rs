//! Backend client and reconciliation layer: HTTP calls to the task
//! backend, a local snapshot cache, and the `Session` that merges
//! optimistic local state with confirmed state and push updates.

pub mod api;
pub mod cache;
pub mod session;

pub use api::{ApiClient, ApiError};
pub use cache::CacheSnapshot;
pub use session::{SendOutcome, Session, SessionConfig, SessionError};
