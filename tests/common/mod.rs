//! Shared fixtures: a scripted cloud transport and a fake v3 LAN appliance.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustmidea::cloud::{BoxError, HttpTransport, SERVER_URL};
use rustmidea::crypto::{Security, cbc_encrypt};
use rustmidea::protocol::{FrameType, V3Codec, lan_frames, lan_packet};
use rustmidea::{CloudConfig, CloudSession, Credentials};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[allow(dead_code)]
pub const ACCOUNT: &str = "user@example.com";

/// Access token whose data key encrypts [`TRANSPARENT_REPLY`].
#[allow(dead_code)]
pub const ACCESS_TOKEN: &str = "87836529d24810fb715db61f2d3eba2ab920ebb829d567559397ded751813801";

/// Encrypted relay reply carrying one short dehumidifier frame.
#[allow(dead_code)]
pub const TRANSPARENT_REPLY: &str = "7c8911b6de8e29fa9a1538def06c9018a9995980893554fb80fd87c5478ac78b360f7b35433b8d451464bdcd3746c4f5c05a8099eceb79aeb9cc2cc712f90f1c9b3bb091bcf0e90bddf62d36f29550796c55acf8e637f7d3d68d11be993df933d94b2b43763219c85eb21b4d9bb9891f1ab4ccf24185ccbcc78c393a9212c24bef3466f9b3f18a6aabcd58e80ce9df61ccf13885ebd714595df69709f09722ff41eb37ea5b06f727b7fab01c94588459ccf13885ebd714595df69709f09722ff32b544a259d2fa6e7ddaac1fdff91bb0";

#[allow(dead_code)]
pub const TRANSPARENT_FRAME: &str = "aa20a100000000000303412100ff030000020000000000000000000000000b24a4";

/// Access token whose data key encrypts [`STATUS_REPLY`].
#[allow(dead_code)]
pub const STATUS_ACCESS_TOKEN: &str =
    "f4fe051b7611d07d54a7f0a5e07ca2beb920ebb829d567559397ded751813801";

/// Encrypted relay reply carrying [`STATUS_FRAME`].
#[allow(dead_code)]
pub const STATUS_REPLY: &str = "02940d3220c4a1a1fcfb4e8593a93c0facebf2d3d170c089f8c9d7274f8048462f8d8ac5ab6b8073382dbc9b9dcc63c293b3dffc38a7bb66832fb4ae3514a40873768e0b3c6cc653c5802496e2b271cba2bfc89ca102623370e8901845328834c53227ac9ea088605ee64825413692b1df952de8baf0dd76ecd34202f91dcc4908baeaf21a29ca4c11203f2c984fd282ec23185ce83c99215494482d87bebdcb3b31f06f44f810c15404be14b1ed8bf090f1e835d796869adf20bf35ff5b7ebc73768e0b3c6cc653c5802496e2b271cb6eb166994a36e79b29551a0dc87fed53";

/// Dehumidifier status: running, mode 4, fan 80, target 35, ion on, 61 %.
#[allow(dead_code)]
pub const STATUS_FRAME: &str =
    "aa22a100000000000303c80104507f7f002300400000000000003d5600000000a4abd7";

#[allow(dead_code)]
pub const DEHUMIDIFIER_ID: u64 = 17592186063322;

// ----------------------------------------------------------------------------
// Scripted cloud
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    Fail(String),
}

/// One recorded POST.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Request {
    pub endpoint: String,
    pub form: BTreeMap<String, String>,
}

/// Transport answering from per endpoint queues.
///
/// The last queued reply of an endpoint is repeated once the queue drains.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<MockReply>>>,
    history: Mutex<Vec<Request>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, endpoint: &str, body: Value) {
        self.push(endpoint, MockReply::Text(body.to_string()));
    }

    pub fn on_text(&self, endpoint: &str, text: &str) {
        self.push(endpoint, MockReply::Text(text.to_string()));
    }

    pub fn fail(&self, endpoint: &str, cause: &str) {
        self.push(endpoint, MockReply::Fail(cause.to_string()));
    }

    /// Drops queued replies of `endpoint` and queues `body`.
    pub fn replace(&self, endpoint: &str, body: Value) {
        self.routes.lock().remove(endpoint);
        self.on(endpoint, body);
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.history.lock().iter().map(|r| r.endpoint.clone()).collect()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.history.lock().clone()
    }

    pub fn count(&self, endpoint: &str) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|r| r.endpoint == endpoint)
            .count()
    }

    fn push(&self, endpoint: &str, reply: MockReply) {
        self.routes
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(reply);
    }

    fn next_reply(&self, endpoint: &str) -> Option<MockReply> {
        let mut routes = self.routes.lock();
        let queue = routes.get_mut(endpoint)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn post_form(
        &self,
        url: &str,
        form: &BTreeMap<String, String>,
    ) -> Result<String, BoxError> {
        // Let concurrent callers interleave the way real requests would.
        tokio::task::yield_now().await;
        let endpoint = url.strip_prefix(SERVER_URL).unwrap_or(url).to_string();
        self.history.lock().push(Request {
            endpoint: endpoint.clone(),
            form: form.clone(),
        });
        match self.next_reply(&endpoint) {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(cause)) => Err(cause.into()),
            None => Err(format!("no reply scripted for {}", endpoint).into()),
        }
    }
}

#[allow(dead_code)]
pub fn cloud(mock: &Arc<MockTransport>) -> Arc<CloudSession> {
    Arc::new(CloudSession::with_transport(
        CloudConfig::default(),
        Credentials::new(ACCOUNT, "pa55word"),
        mock.clone(),
    ))
}

#[allow(dead_code)]
pub fn with_login(mock: &MockTransport, access_token: &str) {
    mock.on(
        "user/login/id/get",
        json!({"errorCode": "0", "result": {"loginId": "test-login"}}),
    );
    mock.on(
        "user/login",
        json!({
            "errorCode": "0",
            "result": {"sessionId": "session-1", "accessToken": access_token}
        }),
    );
}

#[allow(dead_code)]
pub fn with_appliance_list(mock: &MockTransport) {
    mock.on(
        "homegroup/list/get",
        json!({"result": {"list": [{"isDefault": "1", "id": "group-id-1"}]}}),
    );
    mock.on(
        "appliance/list/get",
        json!({"result": {"list": [
            {"id": "1", "name": "Living room", "type": "0xAC"},
            {"id": "2", "name": "Basement", "type": "0xA1"}
        ]}}),
    );
}

// ----------------------------------------------------------------------------
// Fake LAN appliance
// ----------------------------------------------------------------------------

/// Appliance key the fake accepts.
#[allow(dead_code)]
pub const LAN_KEY: [u8; 32] = [0x11; 32];

#[allow(dead_code)]
pub fn lan_token() -> String {
    hex::encode([0x22u8; 64])
}

#[allow(dead_code)]
pub fn lan_key() -> String {
    hex::encode(LAN_KEY)
}

/// TCP server speaking the appliance side of the v3 channel.
#[allow(dead_code)]
pub struct FakeAppliance {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FakeAppliance {
    /// Answers every command with `reply` wrapped for appliance `id`.
    pub async fn spawn(id: u64, reply: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let (frames, count) = (received.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, id, reply.clone(), frames.clone()));
            }
        });

        Self {
            addr,
            received,
            connections,
        }
    }

    /// Appliance frames received so far, in order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[allow(dead_code)]
async fn serve(
    mut stream: TcpStream,
    id: u64,
    reply: Vec<u8>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
) -> Option<()> {
    let mut codec = V3Codec::new();
    let mut buffer = Vec::new();
    let mut buf = [0u8; 1024];

    while buffer.len() < 72 {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&buf[..n]);
    }
    let (hello, rest) = codec.decode(&buffer).ok()?;
    if hello.first().map(Vec::len) != Some(64) {
        return None;
    }
    buffer = rest;

    let plain = [0x5Au8; 32];
    let mut answer = cbc_encrypt(&LAN_KEY, &plain).ok()?;
    answer.extend_from_slice(&Sha256::digest(plain));
    let handshake = codec.encode(&answer, FrameType::HandshakeResponse).ok()?;
    stream.write_all(&handshake).await.ok()?;

    let mut session = [0u8; 32];
    for (s, (p, k)) in session.iter_mut().zip(plain.iter().zip(LAN_KEY.iter())) {
        *s = p ^ k;
    }
    codec.set_tcp_key(session);

    let security = Security::default();
    loop {
        let (packets, rest) = codec.decode(&buffer).ok()?;
        buffer = rest;
        if !packets.is_empty() {
            let frames = lan_frames(&security, &packets).ok()?;
            received.lock().extend(frames);
            let packet = lan_packet(&security, id, &reply);
            let message = codec.encode(&packet, FrameType::EncryptedResponse).ok()?;
            stream.write_all(&message).await.ok()?;
        }
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&buf[..n]);
    }
}
