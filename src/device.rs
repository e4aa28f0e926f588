//! Single appliance client.
//! Talks to the appliance over its v3 LAN channel and falls back to the
//! cloud relay when the LAN path is unavailable.

use crate::cloud::CloudSession;
use crate::command::{
    ApplianceFamily, ApplianceState, Command, OrderCounter, apply_named, parse_response,
};
use crate::crypto::{Security, tcp_key, udp_id};
use crate::error::{MideaError, Result};
use crate::protocol::{FrameType, LAN_PORT, V3Codec, lan_frames, lan_packet};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep, timeout};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(6);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
// Appliances drop requests sent right after the handshake.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
const HANDSHAKE_REPLY_LEN: usize = 72;
const READ_BUFFER: usize = 1024;

/// LAN token and key of one appliance, hex encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct LanCredentials {
    pub token: String,
    pub key: String,
}

impl LanCredentials {
    pub fn new(token: &str, key: &str) -> Self {
        Self {
            token: token.to_string(),
            key: key.to_string(),
        }
    }
}

impl std::fmt::Debug for LanCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanCredentials")
            .field("token", &format!("{}...", &self.token.get(..8).unwrap_or("")))
            .finish()
    }
}

/// Builder for [`ApplianceClient`].
#[derive(Debug, Clone)]
pub struct ApplianceClientBuilder {
    id: u64,
    family: ApplianceFamily,
    address: Option<IpAddr>,
    port: u16,
    credentials: Option<LanCredentials>,
    cloud: Option<Arc<CloudSession>>,
    connect_timeout: Duration,
    local_timeout: Duration,
    timeout: Duration,
    settle_delay: Duration,
}

impl ApplianceClientBuilder {
    pub fn new(id: u64, family: ApplianceFamily) -> Self {
        Self {
            id,
            family,
            address: None,
            port: LAN_PORT,
            credentials: None,
            cloud: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            local_timeout: DEFAULT_LOCAL_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// LAN address; without one the client only uses the cloud relay.
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_token(mut self, token: &str, key: &str) -> Self {
        self.credentials = Some(LanCredentials::new(token, key));
        self
    }

    pub fn with_cloud(mut self, cloud: Arc<CloudSession>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Budget for one LAN attempt, handshake included.
    pub fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = timeout;
        self
    }

    /// Budget for a whole request, LAN attempt and relay fallback together.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn build(self) -> Result<ApplianceClient> {
        if self.address.is_none() && self.cloud.is_none() {
            return Err(MideaError::DeviceNotFound(self.id.to_string()));
        }
        Ok(ApplianceClient {
            id: self.id,
            family: self.family,
            address: self.address.map(|ip| SocketAddr::new(ip, self.port)),
            cloud: self.cloud,
            security: Security::default(),
            counter: OrderCounter::new(),
            credentials: RwLock::new(self.credentials),
            connection: Mutex::new(None),
            state: RwLock::new(None),
            connect_timeout: self.connect_timeout,
            local_timeout: self.local_timeout,
            timeout: self.timeout,
            settle_delay: self.settle_delay,
        })
    }
}

/// Open v3 channel to one appliance.
struct LanConnection {
    stream: TcpStream,
    codec: V3Codec,
    buffer: Vec<u8>,
}

impl LanConnection {
    async fn request(&mut self, packet: &[u8]) -> Result<Vec<Vec<u8>>> {
        let request = self.codec.encode(packet, FrameType::EncryptedRequest)?;
        self.stream.write_all(&request).await?;

        let mut buf = [0u8; READ_BUFFER];
        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(MideaError::ConnectionFailed);
            }
            self.buffer.extend_from_slice(&buf[..n]);
            let (packets, rest) = self.codec.decode(&self.buffer)?;
            self.buffer = rest;
            if !packets.is_empty() {
                return Ok(packets);
            }
        }
    }
}

/// Client for one appliance.
///
/// Commands are sent one at a time; each carries the next value of this
/// client's order counter. The last decoded state is kept so partial
/// changes never reset untouched settings.
pub struct ApplianceClient {
    id: u64,
    family: ApplianceFamily,
    address: Option<SocketAddr>,
    cloud: Option<Arc<CloudSession>>,
    security: Security,
    counter: OrderCounter,
    credentials: RwLock<Option<LanCredentials>>,
    connection: Mutex<Option<LanConnection>>,
    state: RwLock<Option<ApplianceState>>,
    connect_timeout: Duration,
    local_timeout: Duration,
    timeout: Duration,
    settle_delay: Duration,
}

impl std::fmt::Debug for ApplianceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplianceClient")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("address", &self.address)
            .field("relay", &self.cloud.is_some())
            .finish()
    }
}

impl ApplianceClient {
    pub fn builder(id: u64, family: ApplianceFamily) -> ApplianceClientBuilder {
        ApplianceClientBuilder::new(id, family)
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn family(&self) -> ApplianceFamily {
        self.family
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Token and key in use, including ones looked up through the cloud.
    pub fn credentials(&self) -> Option<LanCredentials> {
        self.credentials.read().clone()
    }

    pub fn last_state(&self) -> Option<ApplianceState> {
        self.state.read().clone()
    }

    /// Reads the current appliance state.
    pub async fn query(&self) -> Result<ApplianceState> {
        self.exchange(Command::status_query(self.family)).await
    }

    /// Applies `change` on top of the current state and sends it.
    ///
    /// The state is queried first when none is known yet. Returns the state
    /// the appliance reports after the change.
    pub async fn set_state<F>(&self, change: F) -> Result<ApplianceState>
    where
        F: FnOnce(&mut Command) -> Result<()>,
    {
        let current = match self.last_state() {
            Some(state) => state,
            None => self.query().await?,
        };
        let mut command = Command::from_state(&current);
        change(&mut command)?;
        self.exchange(command).await
    }

    /// Applies textual `name=value` changes, as offered by the family's
    /// settable field table.
    pub async fn set_named(&self, changes: &[(&str, &str)]) -> Result<ApplianceState> {
        self.set_state(|cmd| apply_named(cmd, changes)).await
    }

    /// Closes the LAN connection, if any.
    pub async fn disconnect(&self) {
        if self.connection.lock().await.take().is_some() {
            debug!("Disconnected from appliance {}", self.id);
        }
    }

    // -------------------------------------------------------------------------
    // Internal
    // -------------------------------------------------------------------------

    async fn exchange(&self, mut command: Command) -> Result<ApplianceState> {
        let mut connection = self.connection.lock().await;
        let frame = command.finalize(&self.counter);
        debug!(
            "Sending {} to appliance {}: {}",
            command.message_type(),
            self.id,
            hex::encode(&frame)
        );

        let attempt = async {
            let frames = self.transmit(&mut connection, &frame).await?;
            self.decode_frames(&frames)
        };
        let state = timeout(self.timeout, attempt)
            .await
            .map_err(|_| MideaError::Timeout)??;

        *self.state.write() = Some(state.clone());
        Ok(state)
    }

    /// LAN first, relay when the LAN path fails at the transport level.
    async fn transmit(
        &self,
        connection: &mut Option<LanConnection>,
        frame: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        if self.address.is_some() {
            let local = timeout(self.local_timeout, self.send_local(connection, frame))
                .await
                .unwrap_or(Err(MideaError::Timeout));
            match local {
                Ok(frames) => return Ok(frames),
                Err(e) => {
                    *connection = None;
                    if !e.is_transport() || self.cloud.is_none() {
                        return Err(e);
                    }
                    warn!(
                        "LAN request to appliance {} failed ({}), using cloud relay",
                        self.id, e
                    );
                }
            }
        }
        match &self.cloud {
            Some(cloud) => cloud.appliance_transparent_send(self.id, frame).await,
            None => Err(MideaError::DeviceNotFound(self.id.to_string())),
        }
    }

    async fn send_local(
        &self,
        connection: &mut Option<LanConnection>,
        frame: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let packet = lan_packet(&self.security, self.id, frame);

        if let Some(lan) = connection.as_mut() {
            match lan.request(&packet).await {
                Ok(packets) => return lan_frames(&self.security, &packets),
                Err(e) if e.is_transport() => {
                    debug!("Stale connection to appliance {} ({}), reconnecting", self.id, e);
                    *connection = None;
                }
                Err(e) => return Err(e),
            }
        }

        let lan = connection.insert(self.open().await?);
        let packets = lan.request(&packet).await?;
        lan_frames(&self.security, &packets)
    }

    /// Connects and authenticates, looking up the token through the cloud
    /// when none was configured.
    async fn open(&self) -> Result<LanConnection> {
        if let Some(credentials) = self.credentials() {
            return self.connect(&credentials).await;
        }
        let cloud = self.cloud.as_ref().ok_or_else(|| {
            MideaError::Authentication(format!("missing token/key for appliance {}", self.id))
        })?;

        for big_endian in [false, true] {
            let udp = udp_id(self.id, big_endian);
            let (token, key) = cloud.get_token(&udp).await?;
            if token.is_empty() || key.is_empty() {
                debug!("No token for appliance {} under udpid {}", self.id, udp);
                continue;
            }
            let credentials = LanCredentials { token, key };
            match self.connect(&credentials).await {
                Ok(lan) => {
                    debug!("Token valid for appliance {} under udpid {}", self.id, udp);
                    *self.credentials.write() = Some(credentials);
                    return Ok(lan);
                }
                Err(MideaError::Authentication(reason)) => {
                    debug!("Token for udpid {} rejected: {}", udp, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Err(MideaError::Authentication(format!(
            "no valid token for appliance {}",
            self.id
        )))
    }

    async fn connect(&self, credentials: &LanCredentials) -> Result<LanConnection> {
        let addr = self
            .address
            .ok_or_else(|| MideaError::DeviceNotFound(self.id.to_string()))?;
        let token = hex::decode(&credentials.token)?;
        let key = hex::decode(&credentials.key)?;

        info!("Connecting to appliance {} at {}", self.id, addr);
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MideaError::Timeout)?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => MideaError::ConnectionFailed,
                _ => MideaError::Io(e.to_string()),
            })?;

        let mut codec = V3Codec::new();
        let request = codec.encode(&token, FrameType::HandshakeRequest)?;
        stream.write_all(&request).await?;
        let reply = read_at_least(&mut stream, HANDSHAKE_REPLY_LEN).await?;
        let response = if reply.len() >= HANDSHAKE_REPLY_LEN {
            &reply[8..HANDSHAKE_REPLY_LEN]
        } else {
            &reply[..]
        };
        codec.set_tcp_key(tcp_key(response, &key)?);
        debug!("Handshake with appliance {} complete", self.id);

        sleep(self.settle_delay).await;
        Ok(LanConnection {
            stream,
            codec,
            buffer: reply.get(HANDSHAKE_REPLY_LEN..).unwrap_or_default().to_vec(),
        })
    }

    fn decode_frames(&self, frames: &[Vec<u8>]) -> Result<ApplianceState> {
        let mut latest = None;
        for frame in frames {
            let state = parse_response(frame)?;
            if state.family() != self.family {
                return Err(MideaError::InvalidHeader(format!(
                    "appliance {} answered as {}, expected {}",
                    self.id,
                    state.family(),
                    self.family
                )));
            }
            latest = Some(state);
        }
        latest.ok_or_else(|| {
            MideaError::Protocol(format!("no reply frames from appliance {}", self.id))
        })
    }
}

/// Reads until `len` bytes arrived or the peer closed the stream.
async fn read_at_least(stream: &mut TcpStream, len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len);
    let mut buf = [0u8; READ_BUFFER];
    while data.len() < len {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            if data.is_empty() {
                return Err(MideaError::ConnectionFailed);
            }
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}
