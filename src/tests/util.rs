use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{NetworkConfig, TransportConfig};
use crate::packet::{DataPacket, Packet};
use crate::{TransmissionId, TransportLayer};

/// Installs a per-test subscriber; set `RUST_LOG=wireline=trace` to watch
pub(crate) fn subscribe() -> DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")))
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(subscriber)
}

/// A network tuned for test wall-clock: short latency, no serialization
/// stall, buffers big enough to not be the bottleneck
pub(crate) fn fast_network() -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config
        .latency(Duration::from_millis(4))
        .serialization_delay(false)
        .wire_capacity(1 << 20)
        .wire_slots(1024);
    config
}

pub(crate) fn fast_transport() -> TransportConfig {
    let mut config = TransportConfig::default();
    config
        .send_budget(Duration::from_secs(5))
        .packet_wait(Duration::from_millis(50));
    config
}

pub(crate) fn layer() -> TransportLayer {
    TransportLayer::new(fast_network(), fast_transport()).unwrap()
}

pub(crate) fn layer_with(
    network: impl FnOnce(&mut NetworkConfig),
    transport: impl FnOnce(&mut TransportConfig),
) -> TransportLayer {
    let mut network_config = fast_network();
    network(&mut network_config);
    let mut transport_config = fast_transport();
    transport(&mut transport_config);
    TransportLayer::new(network_config, transport_config).unwrap()
}

/// Deterministic pseudo-random payload; a given seed always produces the
/// same bytes, so senders and verifiers can agree without sharing buffers
pub(crate) fn test_data(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

pub(crate) fn encoded_data_packet(id: u32, index: u32, total: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    Packet::Data(DataPacket {
        id: TransmissionId::new(id).unwrap(),
        index,
        total,
        payload: payload.to_vec(),
    })
    .encode(&mut buf);
    buf
}
