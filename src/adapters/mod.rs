//! Transport adapters
//!
//! An [`Adapter`] performs one request/response exchange with the interrogator.
//! It knows nothing about the command vocabulary: it moves bytes out, and
//! bytes in until the reply delimiter.

pub mod mock_adapter;
pub mod tcp_adapter;

pub use mock_adapter::MockAdapter;
pub use tcp_adapter::TcpAdapter;

use crate::error::AppResult;
use async_trait::async_trait;

/// Byte-level link to a device.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Sends `request` and returns the reply, delimiter included.
    ///
    /// Implementations must release any connection they open before
    /// returning, on success and on every error path.
    async fn exchange(&self, request: &[u8]) -> AppResult<Vec<u8>>;

    /// Short description of the endpoint for log messages.
    fn endpoint(&self) -> String;
}
