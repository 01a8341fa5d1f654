//! Station-mode WiFi as a `node-core` transport.

use embassy_net::Stack;
use esp_radio::wifi::{ClientConfig, ModeConfig, PowerSaveMode, WifiController, WifiError};
use node_core::network::{Credentials, Transport};

/// The link counts as up once associated and holding a DHCP lease.
pub struct WifiTransport {
    controller: WifiController<'static>,
    stack: Stack<'static>,
}

impl WifiTransport {
    pub fn new(controller: WifiController<'static>, stack: Stack<'static>) -> Self {
        Self { controller, stack }
    }

    fn associated(&self) -> bool {
        matches!(self.controller.is_connected(), Ok(true))
    }
}

impl Transport for WifiTransport {
    type Error = WifiError;

    fn is_connected(&self) -> bool {
        self.associated() && self.stack.is_config_up()
    }

    async fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), WifiError> {
        let client = ClientConfig::default()
            .with_ssid(credentials.ssid.into())
            .with_password(credentials.password.into());
        self.controller.set_config(&ModeConfig::Client(client))?;

        if !self.controller.is_started()? {
            self.controller.start_async().await?;
        }
        // Modem sleep stays at its lightest so broker keepalives are not delayed.
        if let Err(err) = self.controller.set_power_saving(PowerSaveMode::Minimum) {
            defmt::warn!("wifi: power save not applied: {}", defmt::Debug2Format(&err));
        }
        self.controller.connect_async().await
    }

    async fn disconnect(&mut self, force: bool) {
        if self.associated() {
            if let Err(err) = self.controller.disconnect_async().await {
                defmt::warn!("wifi: disconnect failed: {}", defmt::Debug2Format(&err));
            }
        }
        if force && matches!(self.controller.is_started(), Ok(true)) {
            if let Err(err) = self.controller.stop_async().await {
                defmt::warn!("wifi: stop failed: {}", defmt::Debug2Format(&err));
            }
        }
    }
}
