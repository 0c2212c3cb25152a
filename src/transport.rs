//! The transport layer: one owning value composing network, sender, and
//! receiver.
//!
//! All engine state lives behind this struct; there are no globals. Drop
//! (or an explicit [`shutdown`](TransportLayer::shutdown)) triggers the
//! process-wide stop flag, which every blocking wait observes, and then
//! joins all engine and simulator threads.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{NetworkConfig, TransportConfig};
use crate::event::Shutdown;
use crate::network::{CreateError, NetworkLayer};
use crate::receiver::ReceiverEngine;
use crate::sender::SenderEngine;
use crate::stats::{TransportCounters, TransportStats};

pub use crate::receiver::{Received, RecvError};
pub use crate::sender::SendError;

/// A reliable transport over the simulated network
///
/// Both roles live in this one value because both sides of the wire run in
/// this process; `send_transmission` and `receive_transmission` may each be
/// called from any number of application threads.
pub struct TransportLayer {
    network: Arc<NetworkLayer>,
    sender: SenderEngine,
    receiver: ReceiverEngine,
    shutdown: Arc<Shutdown>,
    counters: Arc<TransportCounters>,
}

impl TransportLayer {
    /// Builds the network simulator and both transport engines
    pub fn new(
        network_config: NetworkConfig,
        transport_config: TransportConfig,
    ) -> Result<Self, CreateError> {
        transport_config.validate()?;
        let retry_interval = transport_config.effective_retry_interval(&network_config);
        let shutdown = Arc::new(Shutdown::new());
        let counters = Arc::new(TransportCounters::default());
        let network = Arc::new(NetworkLayer::with_shutdown(network_config, shutdown.clone())?);
        let sender = SenderEngine::new(
            network.clone(),
            &transport_config,
            retry_interval,
            shutdown.clone(),
            counters.clone(),
        )?;
        let receiver = ReceiverEngine::new(
            network.clone(),
            &transport_config,
            shutdown.clone(),
            counters.clone(),
        )?;
        debug!(?retry_interval, "transport layer running");
        Ok(Self {
            network,
            sender,
            receiver,
            shutdown,
            counters,
        })
    }

    /// Reliably delivers `data` as transmission `id`, blocking until the
    /// receiver has acknowledged every packet
    ///
    /// Distinct ids are fully independent; calling concurrently with the
    /// same id fails with [`SendError::AlreadyInFlight`].
    pub fn send_transmission(&self, id: u32, data: &[u8]) -> Result<(), SendError> {
        self.sender.send_transmission(id, data)
    }

    /// Waits up to `timeout` for transmission `id` (or, with id 0, for any
    /// completed transmission) and copies its bytes into `dest`
    ///
    /// On success the returned [`Received`] names the delivered id and
    /// length. On timeout `dest` is untouched and any partially or fully
    /// reassembled state is preserved for a later call.
    pub fn receive_transmission(
        &self,
        id: u32,
        dest: &mut [u8],
        timeout: Duration,
    ) -> Result<Received, RecvError> {
        self.receiver.receive_transmission(id, dest, timeout)
    }

    /// Packet-granularity access to the underlying simulated network
    pub fn network(&self) -> &NetworkLayer {
        &self.network
    }

    /// Counters for both engines combined
    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    /// Aborts all in-flight transmissions and joins every engine thread
    ///
    /// Blocked `send_transmission` calls return
    /// [`SendError::ShuttingDown`]; blocked `receive_transmission` calls
    /// return [`RecvError::ShuttingDown`]. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.sender.join();
        self.receiver.join();
        self.network.shutdown();
        debug!("transport layer stopped");
    }
}

impl Drop for TransportLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
