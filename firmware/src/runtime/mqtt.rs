//! MQTT session over an `embassy-net` TCP socket.
//!
//! One socket is reused for every session. Framing comes from
//! `node_core::mqtt`; this module only moves bytes and keeps the client state
//! code the broker manager reads back after a failed attempt.

use embassy_net::Stack;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::{State, TcpSocket};
use embassy_time::with_timeout;
use embedded_io_async::Write;
use node_core::broker::{BrokerClient, SessionErrorCode};
use node_core::config::BrokerEndpoint;
use node_core::mqtt::{self, KeepAlive, KeepAliveAction, MAX_PACKET_LEN, Packet, PacketBuffer};
use static_cell::StaticCell;

use crate::clock::{FirmwareInstant, to_embassy};
use crate::config::SOCKET_BUFFER_SIZE;

static RX_BUFFER: StaticCell<[u8; SOCKET_BUFFER_SIZE]> = StaticCell::new();
static TX_BUFFER: StaticCell<[u8; SOCKET_BUFFER_SIZE]> = StaticCell::new();

pub struct MqttSession {
    stack: Stack<'static>,
    socket: TcpSocket<'static>,
    endpoint: BrokerEndpoint,
    state: SessionErrorCode,
    keepalive: KeepAlive<FirmwareInstant>,
    frame: PacketBuffer,
    inbound: [u8; MAX_PACKET_LEN],
    filled: usize,
}

impl MqttSession {
    /// Claims the static socket buffers; call once.
    pub fn new(stack: Stack<'static>, endpoint: BrokerEndpoint) -> Self {
        let rx = RX_BUFFER.init([0; SOCKET_BUFFER_SIZE]);
        let tx = TX_BUFFER.init([0; SOCKET_BUFFER_SIZE]);
        let mut socket = TcpSocket::new(stack, rx, tx);
        socket.set_timeout(Some(to_embassy(endpoint.socket_timeout)));

        Self {
            stack,
            socket,
            endpoint,
            state: SessionErrorCode::Disconnected,
            keepalive: KeepAlive::new(endpoint.keepalive),
            frame: PacketBuffer::new(),
            inbound: [0; MAX_PACKET_LEN],
            filled: 0,
        }
    }

    async fn open(&mut self, client_id: &str) -> Result<(), SessionErrorCode> {
        let addresses = self
            .stack
            .dns_query(self.endpoint.host, DnsQueryType::A)
            .await
            .map_err(|_| SessionErrorCode::ConnectFailed)?;
        let address = addresses
            .first()
            .copied()
            .ok_or(SessionErrorCode::ConnectFailed)?;

        self.socket
            .connect((address, self.endpoint.port))
            .await
            .map_err(|_| SessionErrorCode::ConnectFailed)?;
        self.keepalive.reset(FirmwareInstant::now());

        mqtt::encode_connect(client_id, self.endpoint.keepalive, &mut self.frame)
            .map_err(|_| SessionErrorCode::BadClientId)?;
        self.send_frame().await?;

        loop {
            match self.receive().await? {
                Packet::ConnAck { return_code: 0, .. } => return Ok(()),
                Packet::ConnAck { return_code, .. } => {
                    return Err(SessionErrorCode::from_connack(return_code));
                }
                _ => {}
            }
        }
    }

    async fn send_frame(&mut self) -> Result<(), SessionErrorCode> {
        let socket = &mut self.socket;
        let frame = &self.frame;
        let written = with_timeout(to_embassy(self.endpoint.socket_timeout), async move {
            match socket.write_all(frame).await {
                Ok(()) => socket.flush().await,
                Err(err) => Err(err),
            }
        })
        .await;

        match written {
            Ok(Ok(())) => {
                self.keepalive.on_sent(FirmwareInstant::now());
                Ok(())
            }
            Ok(Err(_)) => Err(SessionErrorCode::ConnectionLost),
            Err(_) => Err(SessionErrorCode::ConnectionTimeout),
        }
    }

    /// Queues the frame only when the transmit buffer can take all of it, without
    /// waiting for the broker to acknowledge. Returns `false` when it has to wait
    /// for a later service call.
    async fn queue_frame(&mut self) -> Result<bool, SessionErrorCode> {
        let free = self
            .socket
            .send_capacity()
            .saturating_sub(self.socket.send_queue());
        if !self.socket.can_send() || free < self.frame.len() {
            return Ok(false);
        }
        self.socket
            .write_all(&self.frame)
            .await
            .map_err(|_| SessionErrorCode::ConnectionLost)?;
        self.keepalive.on_sent(FirmwareInstant::now());
        Ok(true)
    }

    /// Waits for the next complete inbound packet.
    async fn receive(&mut self) -> Result<Packet, SessionErrorCode> {
        let timeout = to_embassy(self.endpoint.socket_timeout);
        loop {
            if let Some(packet) = self.take_packet()? {
                return Ok(packet);
            }
            let read = with_timeout(timeout, self.socket.read(&mut self.inbound[self.filled..]))
                .await
                .map_err(|_| SessionErrorCode::ConnectionTimeout)?
                .map_err(|_| SessionErrorCode::ConnectionLost)?;
            if read == 0 {
                return Err(SessionErrorCode::ConnectionLost);
            }
            self.filled += read;
        }
    }

    fn take_packet(&mut self) -> Result<Option<Packet>, SessionErrorCode> {
        match mqtt::decode(&self.inbound[..self.filled]) {
            Ok(Some((packet, used))) => {
                self.inbound.copy_within(used..self.filled, 0);
                self.filled -= used;
                self.keepalive.on_received(FirmwareInstant::now());
                Ok(Some(packet))
            }
            // A frame larger than the inbound buffer can never complete.
            Ok(None) if self.filled == self.inbound.len() => Err(SessionErrorCode::ConnectionLost),
            Ok(None) => Ok(None),
            Err(_) => Err(SessionErrorCode::ConnectionLost),
        }
    }

    /// Drains whatever the broker sent and keeps the session alive.
    async fn pump(&mut self) -> Result<(), SessionErrorCode> {
        if self.socket.state() != State::Established {
            return Err(SessionErrorCode::ConnectionLost);
        }

        loop {
            while self.take_packet()?.is_some() {}
            if !self.socket.can_recv() {
                break;
            }
            let read = self
                .socket
                .read(&mut self.inbound[self.filled..])
                .await
                .map_err(|_| SessionErrorCode::ConnectionLost)?;
            if read == 0 {
                return Err(SessionErrorCode::ConnectionLost);
            }
            self.filled += read;
        }

        let now = FirmwareInstant::now();
        match self.keepalive.poll(now) {
            KeepAliveAction::Idle => Ok(()),
            KeepAliveAction::SendPing => {
                mqtt::encode_pingreq(&mut self.frame).map_err(|_| SessionErrorCode::ConnectionLost)?;
                if self.queue_frame().await? {
                    self.keepalive.on_ping_sent(now);
                }
                Ok(())
            }
            KeepAliveAction::Expired => Err(SessionErrorCode::ConnectionTimeout),
        }
    }

    /// Closes whatever a previous or abandoned attempt left open.
    async fn reset_socket(&mut self) {
        if self.socket.state() == State::Established
            && mqtt::encode_disconnect(&mut self.frame).is_ok()
        {
            let _ = self.send_frame().await;
        }
        self.socket.abort();
        self.filled = 0;
    }

    fn drop_session(&mut self, state: SessionErrorCode) {
        defmt::warn!("mqtt: session dropped state={}", state.to_raw());
        self.socket.abort();
        self.filled = 0;
        self.state = state;
    }
}

impl BrokerClient for MqttSession {
    fn is_session_active(&self) -> bool {
        self.state == SessionErrorCode::Connected
    }

    async fn connect(&mut self, client_id: &str) -> bool {
        self.reset_socket().await;
        self.state = SessionErrorCode::Disconnected;

        match self.open(client_id).await {
            Ok(()) => {
                self.state = SessionErrorCode::Connected;
                true
            }
            Err(state) => {
                self.socket.abort();
                self.filled = 0;
                self.state = state;
                false
            }
        }
    }

    async fn service(&mut self) {
        if !self.is_session_active() {
            return;
        }
        if let Err(state) = self.pump().await {
            self.drop_session(state);
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.is_session_active() {
            return false;
        }
        if let Err(err) = mqtt::encode_publish(topic, payload, &mut self.frame) {
            defmt::warn!("mqtt: publish not encoded: {}", defmt::Display2Format(&err));
            return false;
        }
        match self.send_frame().await {
            Ok(()) => true,
            Err(state) => {
                self.drop_session(state);
                false
            }
        }
    }

    fn last_error_code(&self) -> i32 {
        self.state.to_raw()
    }
}
