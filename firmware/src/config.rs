#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Build-time deployment settings.
//!
//! Credentials come from the build environment so they never live in the
//! source tree:
//!
//! ```text
//! NODE_WIFI_SSID=... NODE_WIFI_PASSWORD=... cargo build --release
//! ```

use node_core::config::{BrokerEndpoint, NodeConfig, NodeIdentity};
use node_core::network::Credentials;

/// Heap reserved for the radio driver and the network stack.
pub const HEAP_SIZE: usize = 72 * 1024;

/// Socket buffer size for the broker connection, per direction.
pub const SOCKET_BUFFER_SIZE: usize = 1024;

const WIFI_SSID: &str = match option_env!("NODE_WIFI_SSID") {
    Some(ssid) => ssid,
    None => "",
};

const WIFI_PASSWORD: &str = match option_env!("NODE_WIFI_PASSWORD") {
    Some(password) => password,
    None => "",
};

pub const CREDENTIALS: Credentials = Credentials::new(WIFI_SSID, WIFI_PASSWORD);

pub const NODE_CONFIG: NodeConfig = NodeConfig::new(
    NodeIdentity::new("Atwater-ESP32", "middlines", "Atwater"),
    BrokerEndpoint::new("mqtt.middlines.com", BrokerEndpoint::DEFAULT_PORT),
);

/// Returns `false` when the firmware was built without a network name.
pub const fn credentials_present(credentials: &Credentials) -> bool {
    !credentials.ssid.is_empty()
}
