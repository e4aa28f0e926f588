//! UDP discovery of Midea appliances.
//! Sends the discovery probe to hosts and broadcast ranges, then decodes the
//! encrypted descriptor each appliance answers with.

use crate::command::ApplianceFamily;
use crate::crypto::Security;
use crate::error::{MideaError, Result};
use crate::protocol::{DISCOVERY_MSG, DISCOVERY_PORT, PREFIX_5A5A, PREFIX_8370};
use byteorder::{ByteOrder, LittleEndian};
use futures_util::StreamExt;
use futures_util::stream;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::pin;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_RETRIES: usize = 3;
const MAX_WORKERS: usize = 16;
const RECV_BUFFER: usize = 1024;
// Decrypted descriptor bytes needed past the SSID.
const DESCRIPTOR_TAIL: usize = 75;

/// An appliance that answered a discovery probe.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResult {
    pub id: u64,
    pub address: IpAddr,
    pub port: u16,
    pub appliance_type: u8,
    pub serial_number: String,
    pub ssid: String,
    pub mac: String,
    /// 3 for `8370` replies, 2 for bare `5a5a` replies.
    pub version: u8,
    pub firmware_version: String,
}

impl DiscoveryResult {
    pub fn family(&self) -> Option<ApplianceFamily> {
        ApplianceFamily::try_from(self.appliance_type).ok()
    }

    pub fn supports_cloud_relay(&self) -> bool {
        self.version == 3
    }
}

/// Decodes a discovery reply.
///
/// `source` is used when the descriptor carries no address of its own.
pub fn parse_discovery_reply(data: &[u8], source: IpAddr) -> Result<DiscoveryResult> {
    let version = if data.starts_with(&PREFIX_8370) {
        3
    } else if data.starts_with(&PREFIX_5A5A) {
        2
    } else {
        0
    };
    let data = if data.len() > 24 && data[8..10] == PREFIX_5A5A {
        &data[8..data.len() - 16]
    } else {
        data
    };
    if data.len() <= 56 {
        return Err(MideaError::ResponseTooShort {
            len: data.len(),
            min: 57,
        });
    }

    let id = LittleEndian::read_u48(&data[20..26]);
    let reply = Security::default().aes_decrypt(&data[40..data.len() - 16])?;
    if reply.len() < 41 {
        return Err(MideaError::ResponseTooShort {
            len: reply.len(),
            min: 41,
        });
    }
    let ssid_len = reply[40] as usize;
    if reply.len() < DESCRIPTOR_TAIL + ssid_len {
        return Err(MideaError::ResponseTooShort {
            len: reply.len(),
            min: DESCRIPTOR_TAIL + ssid_len,
        });
    }

    let ip = Ipv4Addr::new(reply[3], reply[2], reply[1], reply[0]);
    let address = if ip.is_unspecified() {
        source
    } else {
        IpAddr::V4(ip)
    };
    let port = LittleEndian::read_u32(&reply[4..8]);
    let serial_number = String::from_utf8_lossy(&reply[8..40])
        .trim_end_matches('\0')
        .to_string();
    let ssid = String::from_utf8_lossy(&reply[41..41 + ssid_len]).to_string();
    let appliance_type = match reply[55 + ssid_len] {
        0 => type_from_ssid(&ssid).ok_or_else(|| {
            MideaError::InvalidHeader(format!("unknown appliance type in SSID '{}'", ssid))
        })?,
        kind => kind,
    };
    let mac = hex::encode(&reply[63 + ssid_len..69 + ssid_len]);
    let firmware = &reply[72 + ssid_len..75 + ssid_len];

    Ok(DiscoveryResult {
        id,
        address,
        port: u16::try_from(port).unwrap_or(crate::protocol::LAN_PORT),
        appliance_type,
        serial_number,
        ssid,
        mac,
        version,
        firmware_version: format!("{}.{}.{}", firmware[0], firmware[1], firmware[2]),
    })
}

/// SSIDs look like `net_a1_XXXX` or `midea_ac_XXXX`.
fn type_from_ssid(ssid: &str) -> Option<u8> {
    let kind = ssid.split('_').nth(1)?;
    u8::from_str_radix(kind, 16).ok()
}

/// Scanner probes hosts and networks for Midea appliances.
#[derive(Debug, Clone)]
pub struct Scanner {
    /// Overall scan deadline
    pub timeout: Duration,
    /// Listening window per target, capped by `timeout`
    pub probe_timeout: Duration,
    /// Local address to bind probe sockets to
    pub bind_addr: String,
    /// Port probes are sent to when a target names none
    pub port: u16,
    /// Upper bound on concurrently probed targets
    pub max_workers: usize,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            probe_timeout: DEFAULT_TIMEOUT,
            bind_addr: "0.0.0.0".to_string(),
            port: DISCOVERY_PORT,
            max_workers: MAX_WORKERS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.probe_timeout = self.probe_timeout.min(timeout);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_bind_addr(mut self, bind_addr: &str) -> Self {
        self.bind_addr = bind_addr.to_string();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    /// Probes every target and returns the appliances that answered.
    ///
    /// Targets are hosts, `host:port` pairs or IPv4 CIDR ranges; an empty
    /// list probes the local network. Silent targets are simply absent from
    /// the result.
    pub async fn scan<S: AsRef<str>>(&self, targets: &[S]) -> Result<Vec<DiscoveryResult>> {
        let addrs = self.resolve_targets(targets).await?;
        let workers = addrs.len().clamp(1, self.max_workers);
        info!(
            "Scanning {} target(s) with {} worker(s), timeout {:?}",
            addrs.len(),
            workers,
            self.timeout
        );

        let deadline = Instant::now() + self.timeout;
        let cancel_token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(64);

        let probes = stream::iter(addrs)
            .map(|addr| {
                let tx = tx.clone();
                let ct = cancel_token.clone();
                async move {
                    if let Err(e) = self.probe(addr, tx, ct, deadline).await {
                        warn!("Discovery probe to {} failed: {}", addr, e);
                    }
                }
            })
            .buffer_unordered(workers)
            .collect::<Vec<()>>();
        let mut probes = pin!(probes);

        let mut found: HashMap<u64, DiscoveryResult> = HashMap::new();
        loop {
            tokio::select! {
                _ = &mut probes => break,
                Some((data, from)) = rx.recv() => Self::collect(&mut found, &data, from),
                _ = sleep_until(deadline), if !cancel_token.is_cancelled() => {
                    debug!("Scan deadline reached");
                    cancel_token.cancel();
                }
            }
        }
        while let Ok((data, from)) = rx.try_recv() {
            Self::collect(&mut found, &data, from);
        }

        let mut results: Vec<DiscoveryResult> = found.into_values().collect();
        results.sort_by_key(|r| r.id);
        info!("Scan finished. Found {} appliance(s).", results.len());
        Ok(results)
    }

    fn collect(found: &mut HashMap<u64, DiscoveryResult>, data: &[u8], from: SocketAddr) {
        match parse_discovery_reply(data, from.ip()) {
            Ok(result) => {
                debug!(
                    "Appliance {} (type {:#04x}) at {} via {}",
                    result.id, result.appliance_type, result.address, from
                );
                found.insert(result.id, result);
            }
            Err(e) => debug!("Ignoring reply from {}: {}", from, e),
        }
    }

    /// Sends the probe to one target and forwards replies until its window
    /// closes or the scan is cancelled.
    async fn probe(
        &self,
        target: SocketAddr,
        tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
        cancel_token: CancellationToken,
        deadline: Instant,
    ) -> Result<()> {
        let socket = self.create_socket()?;
        let window_end = (Instant::now() + self.probe_timeout).min(deadline);
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut sent = 0;
        let mut next_send = Instant::now();

        loop {
            if sent < PROBE_RETRIES && Instant::now() >= next_send {
                debug!("Sending discovery probe to {}", target);
                socket.send_to(&DISCOVERY_MSG, target).await?;
                sent += 1;
                next_send = Instant::now() + PROBE_INTERVAL;
            }
            let wake = if sent < PROBE_RETRIES {
                next_send.min(window_end)
            } else {
                window_end
            };

            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = sleep_until(wake) => {
                    if Instant::now() >= window_end {
                        break;
                    }
                }
                res = socket.recv_from(&mut buf) => {
                    let (len, from) = res?;
                    if tx.send((buf[..len].to_vec(), from)).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn create_socket(&self) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:0", self.bind_addr)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address: {}", e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast: {}", e);
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    async fn resolve_targets<S: AsRef<str>>(&self, targets: &[S]) -> Result<Vec<SocketAddr>> {
        let mut addrs: Vec<SocketAddr> = Vec::new();
        if targets.is_empty() {
            if let Some(addr) = local_broadcast(self.port) {
                addrs.push(addr);
            }
        }
        for target in targets {
            let target = target.as_ref().trim();
            match parse_target(target, self.port) {
                Ok(Some(addr)) => addrs.push(addr),
                Ok(None) => debug!("Skipping loopback or link-local target {}", target),
                Err(_) => match tokio::net::lookup_host(with_port(target, self.port)).await {
                    Ok(mut resolved) => match resolved.find(SocketAddr::is_ipv4) {
                        Some(addr) => addrs.push(addr),
                        None => warn!("No IPv4 address for {}", target),
                    },
                    Err(e) => warn!("Invalid scan target '{}': {}", target, e),
                },
            }
        }
        addrs.sort();
        addrs.dedup();
        if addrs.is_empty() {
            return Err(MideaError::NoNetworks);
        }
        Ok(addrs)
    }
}

fn with_port(target: &str, port: u16) -> String {
    if target.contains(':') {
        target.to_string()
    } else {
        format!("{}:{}", target, port)
    }
}

fn usable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local()
}

/// Resolves a literal target to the address the probe goes to.
///
/// CIDR ranges map to their broadcast address. Loopback and link-local
/// hosts or ranges yield `None`; an explicit `host:port` is kept as given.
pub fn parse_target(target: &str, default_port: u16) -> Result<Option<SocketAddr>> {
    let invalid = || MideaError::DecodeError(format!("invalid scan target '{}'", target));

    if let Some((network, prefix)) = target.split_once('/') {
        let network: Ipv4Addr = network.parse().map_err(|_| invalid())?;
        let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
        let base = Ipv4Addr::from(u32::from(network) & mask);
        if !usable(base) {
            return Ok(None);
        }
        let broadcast = Ipv4Addr::from(u32::from(network) | !mask);
        return Ok(Some(SocketAddr::new(IpAddr::V4(broadcast), default_port)));
    }
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }
    match target.parse::<Ipv4Addr>() {
        Ok(ip) if usable(ip) => Ok(Some(SocketAddr::new(IpAddr::V4(ip), default_port))),
        Ok(_) => Ok(None),
        Err(_) => Err(invalid()),
    }
}

/// Broadcast address of the local /24, found via the outbound interface.
fn local_broadcast(port: u16) -> Option<SocketAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if usable(ip) => {
            let [a, b, c, _] = ip.octets();
            let broadcast = Ipv4Addr::new(a, b, c, 255);
            debug!("Local network {} broadcast {}", ip, broadcast);
            Some(SocketAddr::new(IpAddr::V4(broadcast), port))
        }
        _ => None,
    }
}
