//! HTTP surface: `/ping`, `/metrics` and `/execute`.

mod server;
pub mod types;

pub use server::{ApiServer, ApiState, caller_key};
pub use types::{ErrorResponse, ExecuteRequest, ExecuteResponse, PingResponse};
