//! Access-link (SCUD) reader.
//!
//! The physical exchange with the access controller belongs to a vendor driver. The
//! core only sees it through [`AccessDriver`]: connect, disconnect, one raw channel
//! read, and a stream of asynchronous driver signals. [`AccessLinkReader`] wraps any
//! such driver and turns raw reads into fixed-width [`AccessSample`]s.

use crate::core::{AccessSample, DriverSignal, Endpoint, LinkKind, LinkReader};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Vendor driver boundary for the access link.
///
/// Drivers announce `Connected`, `Disconnected` and `Error` on their signal stream
/// whenever the transport changes, which need not coincide with `connect` /
/// `disconnect` calls.
#[async_trait]
pub trait AccessDriver: Send {
    /// Open the transport to `endpoint`.
    async fn connect(&mut self, endpoint: &Endpoint) -> AppResult<()>;

    /// Close the transport.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Read `count` channel values in one exchange.
    async fn read_raw(&mut self, count: usize) -> AppResult<Vec<f32>>;

    /// Subscribe to the driver's signal stream.
    fn signals(&self) -> broadcast::Receiver<DriverSignal>;
}

/// Lifecycle of a single-use reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Fresh,
    Open,
    Closed,
}

/// Reads fixed-width channel snapshots through an [`AccessDriver`].
pub struct AccessLinkReader<D> {
    driver: D,
    channels: usize,
    timeout: Duration,
    phase: Phase,
}

impl<D: AccessDriver> AccessLinkReader<D> {
    /// Reader expecting exactly `channels` values per snapshot.
    pub fn new(driver: D, channels: usize) -> Self {
        Self {
            driver,
            channels,
            timeout: Duration::from_secs(1),
            phase: Phase::Fresh,
        }
    }

    /// Upper bound on one raw read. Default: 1 second.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl<D: AccessDriver> LinkReader for AccessLinkReader<D> {
    type Sample = AccessSample;

    fn kind(&self) -> LinkKind {
        LinkKind::Access
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> AppResult<()> {
        if self.phase != Phase::Fresh {
            return Err(DaqError::Connection {
                link: LinkKind::Access,
                endpoint: endpoint.to_string(),
                reason: "reader instance already used; build a new one".into(),
            });
        }
        info!("Connecting to {} at {}", LinkKind::Access, endpoint);
        self.driver.connect(endpoint).await?;
        self.phase = Phase::Open;
        Ok(())
    }

    async fn read(&mut self) -> AppResult<AccessSample> {
        if self.phase != Phase::Open {
            return Err(DaqError::Read {
                link: LinkKind::Access,
                reason: "not connected".into(),
            });
        }

        let raw = tokio::time::timeout(self.timeout, self.driver.read_raw(self.channels))
            .await
            .map_err(|_| DaqError::Read {
                link: LinkKind::Access,
                reason: format!("timed out after {:?}", self.timeout),
            })??;

        if raw.len() != self.channels {
            return Err(DaqError::Protocol {
                link: LinkKind::Access,
                reason: format!("expected {} channels, got {}", self.channels, raw.len()),
            });
        }
        debug!(channels = raw.len(), "access snapshot read");

        Ok(AccessSample::new(
            Utc::now(),
            raw.into_iter().map(f64::from).collect(),
        ))
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if self.phase != Phase::Open {
            return Ok(());
        }
        self.phase = Phase::Closed;
        info!("Disconnecting from {}", LinkKind::Access);
        self.driver.disconnect().await
    }

    fn signals(&self) -> Option<broadcast::Receiver<DriverSignal>> {
        Some(self.driver.signals())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{MockAccessDriver, MockLinkControl};
    use std::sync::Arc;

    fn endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 1502)
    }

    #[tokio::test]
    async fn test_width_mismatch_is_protocol_error() {
        let control = Arc::new(MockLinkControl::new());
        control.set_channels(vec![1.0; 14]);
        let mut reader = AccessLinkReader::new(MockAccessDriver::new(control), 15);

        reader.connect(&endpoint()).await.unwrap();
        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, DaqError::Protocol { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_reads_full_snapshot() {
        let control = Arc::new(MockLinkControl::new());
        control.set_channels((0..15).map(f64::from).collect());
        let mut reader = AccessLinkReader::new(MockAccessDriver::new(control), 15);

        reader.connect(&endpoint()).await.unwrap();
        let sample = reader.read().await.unwrap();
        assert_eq!(sample.len(), 15);
        assert_eq!(sample.channels()[14], 14.0);
    }

    #[tokio::test]
    async fn test_instance_is_single_use() {
        let control = Arc::new(MockLinkControl::new());
        let mut reader = AccessLinkReader::new(MockAccessDriver::new(control.clone()), 15);

        reader.connect(&endpoint()).await.unwrap();
        reader.disconnect().await.unwrap();
        reader.disconnect().await.unwrap();
        assert_eq!(control.disconnects(), 1);

        assert!(reader.read().await.is_err());
        assert!(matches!(
            reader.connect(&endpoint()).await,
            Err(DaqError::Connection { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let control = Arc::new(MockLinkControl::new());
        control.push_delay(Duration::from_secs(5));
        let mut reader = AccessLinkReader::new(MockAccessDriver::new(control), 15)
            .with_timeout(Duration::from_millis(200));

        reader.connect(&endpoint()).await.unwrap();
        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, DaqError::Read { .. }), "{err}");
    }
}
