//! Timing constants and async timeout helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Upper bound on waiting for the 768-byte authentication blob
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before the first handshake read attempt
pub const HANDSHAKE_INITIAL_DELAY: Duration = Duration::from_millis(50);

/// Spacing between covert-channel emissions
pub const REQUEST_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period for connection tasks during shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a future with a deadline, mapping expiry to `ProtocolError::Timeout`
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_protocol_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        };
        let res = with_timeout_error(slow, Duration::from_millis(10)).await;
        assert!(matches!(res, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_result_passes_through() {
        let res = with_timeout_error(async { Ok(5u8) }, Duration::from_secs(1)).await;
        assert!(matches!(res, Ok(5)));
    }
}
