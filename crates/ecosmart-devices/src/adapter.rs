//! Inbound device adapters.
//!
//! The monitor reads through a [`DeviceMeter`] and the controller switches
//! through a [`DeviceActuator`]. Real integrations and the simulator both
//! implement these. Callers bound every call with a timeout.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ecosmart_core::{Device, Error, Result};

/// Reads instantaneous power draw.
#[async_trait]
pub trait DeviceMeter: Send + Sync {
    async fn read_watts(&self, device: &Device) -> Result<f64>;
}

/// Switches a device on or off.
#[async_trait]
pub trait DeviceActuator: Send + Sync {
    async fn set_power(&self, device: &Device, on: bool) -> Result<()>;
}

/// Run an adapter call, failing with [`Error::Timeout`] past `limit`.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("{what} exceeded {limit:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout(Duration::from_secs(1), "read", async { Ok(42.0) })
            .await
            .unwrap();
        assert_eq!(value, 42.0);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<f64> = with_timeout(Duration::from_millis(10), "read", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1.0)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
