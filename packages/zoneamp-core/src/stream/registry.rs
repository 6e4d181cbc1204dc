//! Registry owning every live stream driver, keyed by stream id.
//!
//! The registry instantiates a driver the first time its stream is bound
//! to a source, enforces the one-source-per-stream binding, and bounds
//! every driver call with a timeout so a wedged player degrades into a
//! typed error instead of stalling the command engine.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{ApiError, ApiResult};
use crate::model::{Stream, StreamKind};
use crate::stream::{DriverError, DriverFactory, StreamCommand, StreamDriver, StreamInfo};

/// Default bound on any single driver call.
pub const DEFAULT_DRIVER_TIMEOUT: Duration = Duration::from_secs(2);

struct Entry {
    driver: Arc<dyn StreamDriver>,
    kind: StreamKind,
}

/// Maps stream ids to live drivers and their current source binding.
pub struct StreamRegistry {
    drivers: DashMap<u64, Entry>,
    bindings: DashMap<u64, usize>,
    factory: Arc<dyn DriverFactory>,
    timeout: Duration,
}

impl StreamRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>) -> StreamRegistry {
        StreamRegistry {
            drivers: DashMap::new(),
            bindings: DashMap::new(),
            factory,
            timeout: DEFAULT_DRIVER_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(factory: Arc<dyn DriverFactory>, timeout: Duration) -> StreamRegistry {
        StreamRegistry {
            drivers: DashMap::new(),
            bindings: DashMap::new(),
            factory,
            timeout,
        }
    }

    /// The source this stream is currently feeding, if any.
    pub fn binding(&self, stream_id: u64) -> Option<usize> {
        self.bindings.get(&stream_id).map(|b| *b.value())
    }

    /// Binds `stream` to `source_id`, creating its driver on first use.
    ///
    /// The caller (the controller) is responsible for first releasing any
    /// source that currently holds the stream.
    pub async fn bind(&self, stream: &Stream, source_id: usize) -> ApiResult<()> {
        let driver = self.driver_for(stream);
        self.bounded(
            driver.connect(source_id),
            stream.kind,
            &format!("connect stream {}", stream.id),
        )
        .await?;
        self.bindings.insert(stream.id, source_id);
        log::info!(
            "[Streams] {} ({}) connected to source {}",
            stream.name,
            stream.kind.as_str(),
            source_id
        );
        Ok(())
    }

    /// Detaches the stream from its source and stops the driver.
    /// A stream with no live driver unbinds trivially.
    pub async fn unbind(&self, stream_id: u64) -> ApiResult<()> {
        self.bindings.remove(&stream_id);
        let (driver, kind) = match self.drivers.get(&stream_id) {
            Some(entry) => (Arc::clone(&entry.driver), entry.kind),
            None => return Ok(()),
        };
        self.bounded(
            driver.disconnect(),
            kind,
            &format!("disconnect stream {}", stream_id),
        )
        .await?;
        log::info!("[Streams] stream {} disconnected", stream_id);
        Ok(())
    }

    /// Replaces the driver after a config change on a bound stream: the
    /// old instance is disconnected and a fresh one connects to the same
    /// source with the updated fields.
    pub async fn reconnect(&self, stream: &Stream) -> ApiResult<()> {
        let Some(source_id) = self.binding(stream.id) else {
            return Ok(());
        };
        self.unbind(stream.id).await?;
        self.drivers.remove(&stream.id);
        self.bind(stream, source_id).await
    }

    /// Dispatches a command to a bound stream's driver.
    pub async fn command(&self, stream: &Stream, cmd: &StreamCommand) -> ApiResult<()> {
        if self.binding(stream.id).is_none() {
            return Err(ApiError::NotBound(stream.id));
        }
        let driver = self.driver_for(stream);
        self.bounded(
            driver.command(cmd),
            stream.kind,
            &format!("{} on stream {}", cmd, stream.id),
        )
        .await
        .map_err(|e| match e {
            ApiError::UnsupportedCommand { kind, .. } => ApiError::UnsupportedCommand {
                kind,
                cmd: cmd.to_string(),
            },
            other => other,
        })
    }

    /// Now-playing metadata for a stream; a stream with no live driver
    /// reports the default (disconnected) info.
    pub async fn info(&self, stream_id: u64) -> StreamInfo {
        match self.drivers.get(&stream_id).map(|e| Arc::clone(&e.driver)) {
            Some(driver) => {
                match tokio::time::timeout(self.timeout, driver.info()).await {
                    Ok(info) => info,
                    Err(_) => StreamInfo::default(),
                }
            }
            None => StreamInfo::default(),
        }
    }

    /// Drops the stream's driver entirely (stream deleted). The stream
    /// must already be unbound.
    pub fn remove(&self, stream_id: u64) {
        self.bindings.remove(&stream_id);
        self.drivers.remove(&stream_id);
    }

    /// Disconnects every bound stream concurrently; called on shutdown.
    pub async fn shutdown(&self) {
        let bound: Vec<u64> = self.bindings.iter().map(|b| *b.key()).collect();
        let disconnects: Vec<_> = bound
            .iter()
            .map(|&stream_id| async move { (stream_id, self.unbind(stream_id).await) })
            .collect();
        for (stream_id, result) in futures::future::join_all(disconnects).await {
            if let Err(e) = result {
                log::warn!("[Streams] shutdown disconnect of {} failed: {}", stream_id, e);
            }
        }
    }

    fn driver_for(&self, stream: &Stream) -> Arc<dyn StreamDriver> {
        let entry = self.drivers.entry(stream.id).or_insert_with(|| Entry {
            driver: self.factory.create(stream),
            kind: stream.kind,
        });
        Arc::clone(&entry.driver)
    }

    /// Runs a driver future under the timeout bound and maps its errors.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, DriverError>>,
        kind: StreamKind,
        what: &str,
    ) -> ApiResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(DriverError::Unsupported)) => Err(ApiError::UnsupportedCommand {
                kind: kind.as_str(),
                cmd: what.to_string(),
            }),
            Ok(Err(DriverError::Failed(reason))) => Err(ApiError::HardwareFailure {
                reason: format!("{}: {}", what, reason),
                rolled_back: true,
            }),
            Err(_) => Err(ApiError::DriverTimeout(what.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Status, Info};
    use crate::stream::drivers::LoopbackFactory;
    use crate::stream::DriverResult;
    use async_trait::async_trait;

    fn test_stream() -> Stream {
        Status::factory_default(1, Info::default()).streams[0].clone()
    }

    #[tokio::test]
    async fn bind_creates_driver_and_records_binding() {
        let registry = StreamRegistry::new(Arc::new(LoopbackFactory));
        let stream = test_stream();
        registry.bind(&stream, 2).await.unwrap();
        assert_eq!(registry.binding(stream.id), Some(2));
        let info = registry.info(stream.id).await;
        assert_eq!(info.status, crate::stream::DriverStatus::Connected);
    }

    #[tokio::test]
    async fn unbind_without_driver_is_a_noop() {
        let registry = StreamRegistry::new(Arc::new(LoopbackFactory));
        registry.unbind(999).await.unwrap();
    }

    #[tokio::test]
    async fn command_on_unbound_stream_fails() {
        let registry = StreamRegistry::new(Arc::new(LoopbackFactory));
        let stream = test_stream();
        let err = registry
            .command(&stream, &StreamCommand::Play)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotBound(_)));
    }

    struct HangingDriver;

    #[async_trait]
    impl StreamDriver for HangingDriver {
        async fn connect(&self, _source_id: usize) -> DriverResult<()> {
            std::future::pending().await
        }
        async fn disconnect(&self) -> DriverResult<()> {
            Ok(())
        }
        async fn command(&self, _cmd: &StreamCommand) -> DriverResult<()> {
            Ok(())
        }
        async fn info(&self) -> StreamInfo {
            StreamInfo::default()
        }
    }

    struct HangingFactory;

    impl DriverFactory for HangingFactory {
        fn create(&self, _stream: &Stream) -> Arc<dyn StreamDriver> {
            Arc::new(HangingDriver)
        }
    }

    #[tokio::test]
    async fn hung_driver_surfaces_timeout() {
        let registry =
            StreamRegistry::with_timeout(Arc::new(HangingFactory), Duration::from_millis(20));
        let err = registry.bind(&test_stream(), 0).await.unwrap_err();
        assert!(matches!(err, ApiError::DriverTimeout(_)));
    }
}
