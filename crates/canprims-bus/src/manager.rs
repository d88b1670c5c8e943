use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use canprims_frame::{Frame, FrameError, CLASSIC_MAX_PAYLOAD};
use tracing::{debug, info, warn};

use crate::error::{BusError, Result};
use crate::traits::{BusConnector, BusDriver};

/// Configuration for the bus manager.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Largest payload the bus carries. Default: 8 (classic CAN).
    pub max_payload: usize,
    /// Maximum stale frames discarded right after opening.
    pub drain_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_payload: CLASSIC_MAX_PAYLOAD,
            drain_limit: 64,
        }
    }
}

/// Connection state of a [`BusManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connected,
    Shutdown,
}

/// Owns the one live bus handle and reconnects after transport failures.
///
/// A failed `send`/`recv` drops the handle, makes exactly one reconnect
/// attempt and hands the original error back. The caller's frame is never
/// retried here.
pub struct BusManager {
    connector: Box<dyn BusConnector>,
    config: BusConfig,
    driver: RwLock<Option<Arc<dyn BusDriver>>>,
    shutdown: AtomicBool,
    last_error: Mutex<Option<String>>,
    reconnects: AtomicU64,
}

impl BusManager {
    /// Create a disconnected manager with default configuration.
    pub fn new(connector: impl BusConnector + 'static) -> Self {
        Self::with_config(connector, BusConfig::default())
    }

    /// Create a disconnected manager with explicit configuration.
    pub fn with_config(connector: impl BusConnector + 'static, config: BusConfig) -> Self {
        Self {
            connector: Box::new(connector),
            config,
            driver: RwLock::new(None),
            shutdown: AtomicBool::new(false),
            last_error: Mutex::new(None),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Open the bus if it is not already open.
    ///
    /// On failure the manager stays disconnected and records the cause in
    /// [`BusManager::last_error`].
    pub fn connect(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(BusError::Shutdown);
        }

        let mut driver = self.driver.write().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            return Ok(());
        }

        let bus = self.connector.describe();
        match self.connector.open() {
            Ok(opened) => {
                let drained = drain(opened.as_ref(), self.config.drain_limit);
                *driver = Some(Arc::from(opened));
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
                info!(bus = %bus, drained, "bus connected");
                Ok(())
            }
            Err(err) => {
                warn!(bus = %bus, error = %err, "bus connect failed");
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BusState::Connected
    }

    pub fn state(&self) -> BusState {
        if self.is_shutdown() {
            BusState::Shutdown
        } else if self.current().is_some() {
            BusState::Connected
        } else {
            BusState::Disconnected
        }
    }

    /// Cause of the most recent failed connect, cleared on success.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of times the handle was dropped after a transport failure.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Transmit a frame.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        if frame.payload().len() > self.config.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload().len(),
                max: self.config.max_payload,
            }
            .into());
        }

        let driver = self.acquire()?;
        driver.send(frame).inspect_err(|err| self.fail(&driver, err))
    }

    /// Wait up to `timeout` for the next frame.
    pub fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        let driver = self.acquire()?;
        driver.recv(timeout).inspect_err(|err| self.fail(&driver, err))
    }

    /// Release the bus handle. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = self
            .driver
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            debug!(bus = %self.connector.describe(), "bus released");
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<Arc<dyn BusDriver>> {
        self.driver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Live handle, or one reconnect attempt when there is none.
    fn acquire(&self) -> Result<Arc<dyn BusDriver>> {
        if self.is_shutdown() {
            return Err(BusError::Shutdown);
        }
        if let Some(driver) = self.current() {
            return Ok(driver);
        }
        match self.connect() {
            Ok(()) => self.current().ok_or(BusError::Disconnected),
            Err(BusError::Shutdown) => Err(BusError::Shutdown),
            Err(_) => Err(BusError::Disconnected),
        }
    }

    fn fail(&self, failed: &Arc<dyn BusDriver>, err: &BusError) {
        if !err.is_transport() {
            return;
        }

        {
            let mut driver = self.driver.write().unwrap_or_else(PoisonError::into_inner);
            // Another thread may already have replaced the failed handle.
            match driver.as_ref() {
                Some(current) if Arc::ptr_eq(current, failed) => {
                    *driver = None;
                }
                _ => return,
            }
        }

        self.reconnects.fetch_add(1, Ordering::Relaxed);
        warn!(bus = %self.connector.describe(), error = %err, "bus failure, reconnecting");
        if let Err(reconnect_err) = self.connect() {
            debug!(error = %reconnect_err, "reconnect attempt failed");
        }
    }
}

impl Drop for BusManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(driver: &dyn BusDriver, limit: usize) -> usize {
    let mut drained = 0;
    while drained < limit {
        match driver.try_recv() {
            Ok(Some(_)) => drained += 1,
            _ => break,
        }
    }
    drained
}
