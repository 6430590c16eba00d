//! Background device monitor
//!
//! Every period, for every storage unit: probe each device, close the I/O
//! error window, publish fresh free-block counts and roll the activity
//! averages. Health transitions are logged by the storage unit.

use crate::registry::StorageRegistry;
use chunkvault_common::{Error, Result};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Handle of the monitor thread
pub struct DeviceMonitor {
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeviceMonitor {
    /// Spawn the monitor thread
    pub fn start(registry: Arc<StorageRegistry>, period: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("device-monitor".to_string())
            .spawn(move || {
                info!("Device monitor started, period {:?}", period);
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => Self::run_once(&registry),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Device monitor stopped");
            })
            .map_err(|e| Error::internal(format!("cannot spawn device monitor: {e}")))?;

        Ok(Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// One monitoring pass over every unit
    pub fn run_once(registry: &StorageRegistry) {
        for unit in registry.iter() {
            unit.run_health_cycle();
            debug!(
                "Monitored storage {}/{}: {:?}",
                unit.cid(),
                unit.sid(),
                unit.stat()
            );
        }
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&self) {
        drop(self.stop_tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
