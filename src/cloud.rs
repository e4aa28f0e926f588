//! Midea cloud session.
//! Login, appliance listing, token lookup and the transparent relay, wrapped
//! in the session restart policy the cloud expects from its clients.

use crate::crypto::{DEFAULT_APPKEY, Security};
use crate::error::{
    ERR_FULL_RESTART, ERR_SESSION_INVALID, MideaError, Result, get_error_message,
};
use crate::protocol::{decode_signed_csv, encode_signed_csv, relay_packet, split_relay_reply};
use async_trait::async_trait;
use chrono::Local;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const SERVER_URL: &str = "https://mapp.appsmb.com/v1/";
pub const DEFAULT_APP_ID: &str = "1017";

const CLIENT_TYPE: &str = "1";
const FORMAT: &str = "2";
const LANGUAGE: &str = "en_US";
const SRC: &str = "17";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 9;

// Attempts per logical request, restarts included.
const MAX_ATTEMPTS: usize = 3;

const EP_LOGIN_ID: &str = "user/login/id/get";
const EP_LOGIN: &str = "user/login";
const EP_HOME_GROUPS: &str = "homegroup/list/get";
const EP_APPLIANCES: &str = "appliance/list/get";
const EP_TOKEN: &str = "iot/secure/getToken";
const EP_TRANSPARENT_SEND: &str = "appliance/transparent/send";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cloud endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub server_url: String,
    pub appkey: String,
    pub app_id: String,
    pub http_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            server_url: SERVER_URL.to_string(),
            appkey: DEFAULT_APPKEY.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl CloudConfig {
    pub fn with_server_url(mut self, server_url: &str) -> Self {
        self.server_url = server_url.to_string();
        self
    }

    pub fn with_appkey(mut self, appkey: &str) -> Self {
        self.appkey = appkey.to_string();
        self
    }

    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.app_id = app_id.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Account used to log in to the cloud.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub account: String,
    pub password: String,
}

impl Credentials {
    pub fn new(account: &str, password: &str) -> Self {
        Self {
            account: account.to_string(),
            password: password.to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A logged in cloud session. Replaced as a whole on re-login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub login_id: String,
    pub session_id: String,
    pub access_token: String,
}

/// Appliance entry from `appliance/list/get`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApplianceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sn: String,
    #[serde(rename = "modelNumber")]
    pub model_number: String,
    #[serde(rename = "onlineStatus")]
    pub online_status: String,
}

impl ApplianceInfo {
    pub fn appliance_id(&self) -> Option<u64> {
        self.id.trim().parse().ok()
    }

    /// Appliance type byte, reported by the cloud as text such as `0xA1`.
    pub fn type_byte(&self) -> Option<u8> {
        let kind = self.kind.trim();
        let digits = kind
            .strip_prefix("0x")
            .or_else(|| kind.strip_prefix("0X"))
            .unwrap_or(kind);
        u8::from_str_radix(digits, 16).ok()
    }

    pub fn online(&self) -> bool {
        self.online_status == "1"
    }
}

/// Per appliance LAN credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApplianceToken {
    #[serde(rename = "udpId")]
    pub udp_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub key: String,
}

/// Form POST seam for the cloud API.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_form(
        &self,
        url: &str,
        form: &BTreeMap<String, String>,
    ) -> std::result::Result<String, BoxError>;
}

/// Default transport over `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MideaError::Io(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_form(
        &self,
        url: &str,
        form: &BTreeMap<String, String>,
    ) -> std::result::Result<String, BoxError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "errorCode", default)]
    error_code: Option<Value>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

impl Envelope {
    fn into_result(self, endpoint: &str) -> Result<Option<Value>> {
        let code = match &self.error_code {
            None | Some(Value::Null) => 0,
            Some(Value::String(s)) => s.trim().parse::<u32>().map_err(|_| {
                request_error(endpoint, format!("Invalid errorCode '{}' from Midea API", s))
            })?,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| request_error(endpoint, format!("Invalid errorCode {}", n)))?,
            Some(other) => {
                return Err(request_error(
                    endpoint,
                    format!("Invalid errorCode {} from Midea API", other),
                ));
            }
        };
        if code != 0 {
            let message = self
                .msg
                .unwrap_or_else(|| get_error_message(code).to_string());
            return Err(MideaError::from_cloud(code, message));
        }
        Ok(self.result.filter(|r| !r.is_null()))
    }
}

fn request_error(endpoint: &str, message: impl Into<String>) -> MideaError {
    MideaError::CloudRequest {
        endpoint: endpoint.to_string(),
        message: message.into(),
    }
}

fn url_path(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Restart needed before a request can be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Restart {
    Session,
    Full,
}

impl Restart {
    fn for_error(err: &MideaError) -> Option<Self> {
        match err.code() {
            Some(ERR_SESSION_INVALID) => Some(Restart::Session),
            Some(ERR_FULL_RESTART) => Some(Restart::Full),
            _ => None,
        }
    }
}

/// Shared handle to the vendor cloud.
///
/// All session mutation goes through one login lock, so concurrent callers
/// that hit an expired session share a single re-login.
pub struct CloudSession {
    config: CloudConfig,
    credentials: Credentials,
    security: Security,
    transport: Arc<dyn HttpTransport>,
    session: RwLock<Option<Arc<Session>>>,
    login_lock: tokio::sync::Mutex<()>,
    home_group: RwLock<Option<String>>,
    appliances: RwLock<Vec<ApplianceInfo>>,
    tokens: RwLock<HashMap<String, ApplianceToken>>,
}

impl std::fmt::Debug for CloudSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSession")
            .field("server_url", &self.config.server_url)
            .field("appkey", &self.config.appkey)
            .field("account", &self.credentials.account)
            .field("logged_in", &self.session.read().is_some())
            .finish()
    }
}

impl CloudSession {
    /// Creates a session using the default HTTP transport.
    pub fn new(config: CloudConfig, credentials: Credentials) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.http_timeout())?);
        Ok(Self::with_transport(config, credentials, transport))
    }

    pub fn with_transport(
        config: CloudConfig,
        credentials: Credentials,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let security = Security::new(&config.appkey);
        Self {
            config,
            credentials,
            security,
            transport,
            session: RwLock::new(None),
            login_lock: tokio::sync::Mutex::new(()),
            home_group: RwLock::new(None),
            appliances: RwLock::new(Vec::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Calls `endpoint` with plain form arguments.
    ///
    /// Returns the `result` member of the response, `None` when absent.
    /// Session restarts requested by the cloud are handled here.
    pub async fn api_request(
        &self,
        endpoint: &str,
        args: &[(&str, &str)],
        authenticate: bool,
    ) -> Result<Option<Value>> {
        let args: Vec<(String, String)> = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let args = &args;
        self.with_restarts(endpoint, authenticate, move || {
            self.post(endpoint, args.clone())
        })
        .await
    }

    /// Calls `endpoint` with a JSON body encrypted under the app key.
    ///
    /// A textual `result` is decrypted back into JSON; structured results
    /// are returned as received.
    pub async fn api_request_encrypted(
        &self,
        endpoint: &str,
        body: &Value,
        authenticate: bool,
    ) -> Result<Option<Value>> {
        let data = self.security.encrypt_request_body(body)?;
        let args = vec![("data".to_string(), data)];
        let args = &args;
        let result = self
            .with_restarts(endpoint, authenticate, move || {
                self.post(endpoint, args.clone())
            })
            .await?;
        match result {
            Some(Value::String(text)) => Ok(Some(self.security.decrypt_response_body(&text)?)),
            other => Ok(other),
        }
    }

    /// Logs in unless a session already exists.
    pub async fn authenticate(&self) -> Result<Arc<Session>> {
        match self.session() {
            Some(session) => Ok(session),
            None => self.relogin(None).await,
        }
    }

    /// Appliances of the default home group, cached after the first call.
    pub async fn list_appliances(&self, force: bool) -> Result<Vec<ApplianceInfo>> {
        if !force {
            let cached = self.appliances.read().clone();
            if !cached.is_empty() {
                return Ok(cached);
            }
        }
        self.with_restarts(EP_APPLIANCES, true, move || self.refresh_appliances(force))
            .await
    }

    /// LAN token and key for a `udp_id`.
    ///
    /// Unknown ids yield two empty strings.
    pub async fn get_token(&self, udp_id: &str) -> Result<(String, String)> {
        if let Some(found) = self.tokens.read().get(udp_id) {
            return Ok((found.token.clone(), found.key.clone()));
        }
        let result = self
            .api_request(EP_TOKEN, &[("udpid", udp_id)], true)
            .await?;
        let entries: Vec<ApplianceToken> = match result.and_then(|r| r.get("tokenlist").cloned()) {
            Some(list) => serde_json::from_value(list)?,
            None => Vec::new(),
        };
        debug!("Received {} token(s) for udpid {}", entries.len(), udp_id);

        let mut tokens = self.tokens.write();
        for entry in entries {
            tokens.insert(entry.udp_id.clone(), entry);
        }
        Ok(tokens
            .get(udp_id)
            .map(|t| (t.token.clone(), t.key.clone()))
            .unwrap_or_default())
    }

    /// Relays a finalized appliance command through the cloud.
    ///
    /// Returns every appliance frame carried by the reply, in order.
    pub async fn appliance_transparent_send(
        &self,
        appliance_id: u64,
        command: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let packet = relay_packet(appliance_id, command);
        debug!("Relaying to {}: {}", appliance_id, hex::encode(&packet));
        let encoded = encode_signed_csv(&packet);
        let appliance = appliance_id.to_string();
        let (encoded, appliance) = (&encoded, &appliance);

        let result = self
            .with_restarts(EP_TRANSPARENT_SEND, true, move || async move {
                // The data key rotates with each login.
                let order = self.security.aes_encrypt_string(encoded)?;
                self.post(
                    EP_TRANSPARENT_SEND,
                    vec![
                        ("order".to_string(), order),
                        ("funId".to_string(), "0000".to_string()),
                        ("applianceId".to_string(), appliance.clone()),
                    ],
                )
                .await
            })
            .await?;

        let reply = result
            .as_ref()
            .and_then(|r| text_field(r, "reply"))
            .ok_or_else(|| request_error(EP_TRANSPARENT_SEND, "Missing reply from Midea API"))?;
        let reply = decode_signed_csv(&self.security.aes_decrypt_string(&reply)?)?;
        debug!("Relay reply from {}: {}", appliance_id, hex::encode(&reply));
        split_relay_reply(&reply)
    }

    // -------------------------------------------------------------------------
    // Internal
    // -------------------------------------------------------------------------

    /// Runs `op`, restarting the session when the cloud asks for it.
    ///
    /// Each restart kind is allowed once per logical request; asking for the
    /// same kind again exhausts the budget.
    async fn with_restarts<T, F, Fut>(&self, endpoint: &str, authenticate: bool, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut session_restarted = false;
        let mut full_restarted = false;
        for attempt in 1..=MAX_ATTEMPTS {
            if authenticate {
                self.authenticate().await?;
            }
            let used = self.session();
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(restart) = Restart::for_error(&err) else {
                return Err(err);
            };
            let repeated = match restart {
                Restart::Session => std::mem::replace(&mut session_restarted, true),
                Restart::Full => std::mem::replace(&mut full_restarted, true),
            };
            if repeated || attempt == MAX_ATTEMPTS {
                warn!("Giving up on {} after {}", endpoint, err);
                return Err(MideaError::too_many_retries(endpoint));
            }
            debug!("Retrying {} after {} (attempt {})", endpoint, err, attempt);

            self.invalidate(used.as_ref());
            self.relogin(used).await?;
            if restart == Restart::Full {
                self.refresh_appliances(true).await?;
            }
        }
        Err(MideaError::too_many_retries(endpoint))
    }

    /// Single POST without restart handling.
    async fn post(&self, endpoint: &str, args: Vec<(String, String)>) -> Result<Option<Value>> {
        let mut form = BTreeMap::new();
        form.insert("appId".to_string(), self.config.app_id.clone());
        form.insert("format".to_string(), FORMAT.to_string());
        form.insert("clientType".to_string(), CLIENT_TYPE.to_string());
        form.insert("language".to_string(), LANGUAGE.to_string());
        form.insert("src".to_string(), SRC.to_string());
        form.insert(
            "stamp".to_string(),
            Local::now().format("%Y%m%d%H%M%S").to_string(),
        );
        form.extend(args);
        if let Some(session) = self.session() {
            form.insert("sessionId".to_string(), session.session_id.clone());
        }

        let url = format!("{}{}", self.config.server_url, endpoint);
        let sign = self.security.sign(&url_path(&url), &form);
        form.insert("sign".to_string(), sign);
        debug!("POST {} ({} fields)", url, form.len());

        let text = self
            .transport
            .post_form(&url, &form)
            .await
            .map_err(|e| MideaError::request_failed(endpoint, e))?;
        debug!("Response from {}: {}", endpoint, text);

        let envelope: Envelope = serde_json::from_str(&text).map_err(|e| {
            request_error(
                endpoint,
                format!("Invalid response {} while calling {}", e, endpoint),
            )
        })?;
        envelope.into_result(endpoint)
    }

    /// Drops the session if it is still the one a failed request used.
    fn invalidate(&self, stale: Option<&Arc<Session>>) {
        let mut current = self.session.write();
        let is_stale = match (current.as_ref(), stale) {
            (Some(current), Some(stale)) => Arc::ptr_eq(current, stale),
            _ => false,
        };
        if is_stale {
            *current = None;
        }
    }

    /// Logs in under the login lock.
    ///
    /// A caller that queued behind another login sees that login's session
    /// instead of starting a second one.
    async fn relogin(&self, stale: Option<Arc<Session>>) -> Result<Arc<Session>> {
        let _guard = self.login_lock.lock().await;
        if let Some(current) = self.session() {
            let superseded = stale.as_ref().is_some_and(|s| Arc::ptr_eq(s, &current));
            if !superseded {
                return Ok(current);
            }
            *self.session.write() = None;
        }
        self.login().await
    }

    async fn login(&self) -> Result<Arc<Session>> {
        let account = self.credentials.account.clone();
        let result = self
            .post(EP_LOGIN_ID, vec![("loginAccount".to_string(), account.clone())])
            .await?;
        let login_id = result
            .as_ref()
            .and_then(|r| text_field(r, "loginId"))
            .ok_or_else(|| request_error(EP_LOGIN_ID, "Unable to get login id from Midea API"))?;

        let password = self
            .security
            .encrypt_password(&login_id, &self.credentials.password);
        let result = self
            .post(
                EP_LOGIN,
                vec![
                    ("loginAccount".to_string(), account.clone()),
                    ("password".to_string(), password),
                ],
            )
            .await?
            .ok_or_else(|| request_error(EP_LOGIN, "Empty login response from Midea API"))?;
        let session_id = text_field(&result, "sessionId")
            .ok_or_else(|| request_error(EP_LOGIN, "Missing sessionId in login response"))?;
        let access_token = text_field(&result, "accessToken")
            .ok_or_else(|| request_error(EP_LOGIN, "Missing accessToken in login response"))?;

        self.security.set_access_token(&access_token)?;
        let session = Arc::new(Session {
            login_id,
            session_id,
            access_token,
        });
        *self.session.write() = Some(session.clone());
        info!("Logged in to Midea cloud as {}", account);
        Ok(session)
    }

    async fn refresh_appliances(&self, refetch_group: bool) -> Result<Vec<ApplianceInfo>> {
        let cached_group = self.home_group.read().clone();
        let group_id = match cached_group {
            Some(id) if !refetch_group => id,
            _ => {
                let result = self.post(EP_HOME_GROUPS, Vec::new()).await?;
                let id = default_home_group(result.as_ref())?;
                *self.home_group.write() = Some(id.clone());
                id
            }
        };

        let result = self
            .post(EP_APPLIANCES, vec![("homegroupId".to_string(), group_id)])
            .await?;
        let appliances: Vec<ApplianceInfo> = match result.and_then(|r| r.get("list").cloned()) {
            Some(list) => serde_json::from_value(list)?,
            None => {
                return Err(request_error(
                    EP_APPLIANCES,
                    "Unable to get appliances from Midea API",
                ));
            }
        };
        debug!("Midea appliance list: {:?}", appliances);
        *self.appliances.write() = appliances.clone();
        Ok(appliances)
    }
}

fn default_home_group(result: Option<&Value>) -> Result<String> {
    let groups = result
        .and_then(|r| r.get("list"))
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .ok_or_else(|| request_error(EP_HOME_GROUPS, "Unable to get home groups from Midea API"))?;
    let defaults: Vec<&Value> = groups
        .iter()
        .filter(|g| text_field(g, "isDefault").as_deref() == Some("1"))
        .collect();
    match defaults.as_slice() {
        [group] => text_field(group, "id").ok_or_else(|| {
            request_error(EP_HOME_GROUPS, "Default home group has no id in Midea API")
        }),
        _ => Err(request_error(
            EP_HOME_GROUPS,
            "Unable to get default home group from Midea API",
        )),
    }
}
