//! In-process CRM platform double for integration tests.
//!
//! Serves the SOAP login endpoint, an OAuth2 token endpoint and the
//! long-polling streaming endpoints on an ephemeral port. Tests publish
//! change events through the returned handle (or `POST /api/event`) and
//! assert against the handle's counters. Replay ids and commit numbers come
//! from one shared monotonic counter starting at 1.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::http::header;
use actix_web::{post, web, App, HttpRequest, HttpResponse, HttpServer};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info};
use url::Url;

#[derive(Clone)]
struct StoredEvent {
    replay_id: i64,
    payload: serde_json::Value,
}

#[derive(Default)]
struct ClientSession {
    /// Channel name to index of the next undelivered log entry.
    subscriptions: HashMap<String, usize>,
}

struct Counters {
    logins: AtomicUsize,
    token_grants: AtomicUsize,
    handshakes: AtomicUsize,
    subscribes: Mutex<HashMap<String, usize>>,
}

struct ServerState {
    username: String,
    password: String,
    /// How long `/connect` holds an idle poll before answering empty.
    keep_alive: Duration,
    token_seq: AtomicU64,
    active_tokens: Mutex<HashSet<String>>,
    client_seq: AtomicU64,
    clients: Mutex<HashMap<String, ClientSession>>,
    channel_logs: Mutex<HashMap<String, Vec<StoredEvent>>>,
    replay_seq: AtomicI64,
    counters: Counters,
    hold_subscribe: AtomicBool,
    wakeup: Notify,
}

/// Builder for the mock server. Spawn with [`MockCrm::spawn`].
pub struct MockCrm {
    username: String,
    password: String,
    keep_alive: Duration,
}

impl MockCrm {
    pub fn new() -> Self {
        Self {
            username: "user@example.com".to_string(),
            password: "hunter2".to_string(),
            keep_alive: Duration::from_secs(1),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Binds an ephemeral port and serves the mock in the background.
    pub async fn spawn(self) -> std::io::Result<MockCrmHandle> {
        let state = Arc::new(ServerState {
            username: self.username,
            password: self.password,
            keep_alive: self.keep_alive,
            token_seq: AtomicU64::new(0),
            active_tokens: Mutex::new(HashSet::new()),
            client_seq: AtomicU64::new(0),
            clients: Mutex::new(HashMap::new()),
            channel_logs: Mutex::new(HashMap::new()),
            replay_seq: AtomicI64::new(1),
            counters: Counters {
                logins: AtomicUsize::new(0),
                token_grants: AtomicUsize::new(0),
                handshakes: AtomicUsize::new(0),
                subscribes: Mutex::new(HashMap::new()),
            },
            hold_subscribe: AtomicBool::new(false),
            wakeup: Notify::new(),
        });

        let app_state = state.clone();
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::from(app_state.clone()))
                .service(soap_login)
                .service(oauth_token)
                .service(handshake)
                .service(subscribe)
                .service(connect)
                .service(unsubscribe)
                .service(disconnect)
                .service(inject_event)
        })
        .workers(1)
        .listen(listener)?
        .run();

        let server_handle = server.handle();
        actix_rt::spawn(server);

        let base_url = Url::parse(&format!("http://{addr}"))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        info!(%base_url, "mock CRM server listening");
        Ok(MockCrmHandle {
            base_url,
            state,
            server: server_handle,
        })
    }
}

impl Default for MockCrm {
    fn default() -> Self {
        Self::new()
    }
}

/// Running mock server: base URL, test hooks and counters.
pub struct MockCrmHandle {
    base_url: Url,
    state: Arc<ServerState>,
    server: ServerHandle,
}

impl MockCrmHandle {
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Mints a token the streaming endpoints will accept. For OAuth2 token
    /// callbacks; synchronous so callbacks need no HTTP round trip.
    pub fn mint_token(&self) -> String {
        mint_token(&self.state)
    }

    /// Invalidates every outstanding token. The next authenticated call
    /// answers 401 until a new login or token grant happens.
    pub fn revoke_tokens(&self) {
        self.state.active_tokens.lock().unwrap().clear();
        debug!("all mock tokens revoked");
    }

    /// While set, `/subscribe` stalls instead of acknowledging.
    pub fn hold_subscribes(&self, hold: bool) {
        self.state.hold_subscribe.store(hold, Ordering::SeqCst);
    }

    /// Appends a change event to `channel`'s retained log and wakes pending
    /// polls. Returns the assigned replay id.
    pub fn publish(
        &self,
        channel: &str,
        change_type: &str,
        entity_name: &str,
        record_id: &str,
        changed_fields: serde_json::Value,
    ) -> i64 {
        let fields = changed_fields.as_object().cloned().unwrap_or_default();
        publish_event(
            &self.state,
            channel,
            change_type,
            entity_name,
            record_id,
            fields,
        )
    }

    pub fn login_count(&self) -> usize {
        self.state.counters.logins.load(Ordering::SeqCst)
    }

    pub fn token_grant_count(&self) -> usize {
        self.state.counters.token_grants.load(Ordering::SeqCst)
    }

    pub fn handshake_count(&self) -> usize {
        self.state.counters.handshakes.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.state
            .counters
            .subscribes
            .lock()
            .unwrap()
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Total tokens ever minted, across login and token-grant paths.
    pub fn minted_token_count(&self) -> u64 {
        self.state.token_seq.load(Ordering::SeqCst)
    }

    pub async fn shutdown(self) {
        self.server.stop(false).await;
    }
}

fn mint_token(state: &ServerState) -> String {
    let id = state.token_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("00Dmock!{id:08}");
    state.active_tokens.lock().unwrap().insert(token.clone());
    token
}

fn publish_event(
    state: &ServerState,
    channel: &str,
    change_type: &str,
    entity_name: &str,
    record_id: &str,
    changed_fields: serde_json::Map<String, serde_json::Value>,
) -> i64 {
    let replay_id = state.replay_seq.fetch_add(1, Ordering::SeqCst);
    let record_ids: Vec<&str> = if record_id.is_empty() {
        Vec::new()
    } else {
        vec![record_id]
    };
    let mut payload = changed_fields;
    payload.insert(
        "ChangeEventHeader".to_string(),
        serde_json::json!({
            "commitTimestamp": chrono::Utc::now().timestamp_millis(),
            "transactionKey": format!("0001-{replay_id:06}"),
            "changeOrigin": "com/crm/api/soap/mock",
            "changeType": change_type,
            "entityName": entity_name,
            "sequenceNumber": 1,
            "commitUser": "005000000000001",
            "commitNumber": replay_id,
            "recordIds": record_ids,
        }),
    );
    state
        .channel_logs
        .lock()
        .unwrap()
        .entry(channel.to_string())
        .or_default()
        .push(StoredEvent {
            replay_id,
            payload: serde_json::Value::Object(payload),
        });
    state.wakeup.notify_waiters();
    debug!(channel, replay_id, change_type, "event published");
    replay_id
}

fn base_url_of(req: &HttpRequest) -> String {
    format!("http://{}", req.connection_info().host())
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn authorized(state: &ServerState, req: &HttpRequest) -> bool {
    match bearer_token(req) {
        Some(token) => state.active_tokens.lock().unwrap().contains(&token),
        None => false,
    }
}

/// Text between `<urn:{tag}>` and `</urn:{tag}>`, as produced by the login
/// envelope.
fn tag_text<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<urn:{tag}>");
    let close = format!("</urn:{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

fn start_index(log: &[StoredEvent], replay_from: i64) -> usize {
    match replay_from {
        -2 => 0,
        -1 => log.len(),
        n => log.partition_point(|event| event.replay_id <= n),
    }
}

enum Drained {
    UnknownClient,
    Events(Vec<serde_json::Value>),
}

fn drain_events(state: &ServerState, client_id: &str) -> Drained {
    let mut clients = state.clients.lock().unwrap();
    let Some(session) = clients.get_mut(client_id) else {
        return Drained::UnknownClient;
    };
    let logs = state.channel_logs.lock().unwrap();
    let mut out = Vec::new();
    for (channel, cursor) in session.subscriptions.iter_mut() {
        if let Some(log) = logs.get(channel) {
            for event in &log[*cursor..] {
                out.push(serde_json::json!({
                    "channel": channel,
                    "data": {
                        "event": { "replayId": event.replay_id },
                        "payload": event.payload.clone()
                    }
                }));
            }
            *cursor = log.len();
        }
    }
    Drained::Events(out)
}

/// POST /services/Soap/u/{version}/
/// SOAP login: session envelope for the configured credentials, fault
/// envelope with HTTP 500 otherwise.
#[post("/services/Soap/u/{version}/")]
async fn soap_login(
    state: web::Data<ServerState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let version = path.into_inner();
    let body = String::from_utf8_lossy(&body);
    let username = tag_text(&body, "username").unwrap_or_default();
    let password = tag_text(&body, "password").unwrap_or_default();

    if username != state.username || password != state.password {
        debug!(username, "login rejected");
        return HttpResponse::InternalServerError()
            .content_type("text/xml;charset=UTF-8")
            .body(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">\
                 <soapenv:Body><soapenv:Fault><faultcode>sf:INVALID_LOGIN</faultcode>\
                 <faultstring>INVALID_LOGIN: Invalid username, password, security token; \
                 or user locked out.</faultstring>\
                 </soapenv:Fault></soapenv:Body></soapenv:Envelope>"
                    .to_string(),
            );
    }

    state.counters.logins.fetch_add(1, Ordering::SeqCst);
    let token = mint_token(&state);
    let server_url = format!(
        "{}/services/Soap/u/{}/00D000000000001",
        base_url_of(&req),
        version
    );
    info!(username, "login accepted");
    HttpResponse::Ok()
        .content_type("text/xml;charset=UTF-8")
        .body(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <soapenv:Body><loginResponse><result>\
             <serverUrl>{server_url}</serverUrl>\
             <sessionId>{token}</sessionId>\
             </result></loginResponse></soapenv:Body></soapenv:Envelope>"
        ))
}

/// POST /services/oauth2/token
#[post("/services/oauth2/token")]
async fn oauth_token(state: web::Data<ServerState>, req: HttpRequest) -> HttpResponse {
    state.counters.token_grants.fetch_add(1, Ordering::SeqCst);
    let token = mint_token(&state);
    HttpResponse::Ok().json(serde_json::json!({
        "access_token": token,
        "instance_url": base_url_of(&req),
        "token_type": "Bearer"
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeBody {
    client_id: String,
    channel: String,
    replay_from: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientBody {
    client_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnsubscribeBody {
    client_id: String,
    channel: String,
}

/// POST /cometd/{version}/handshake
#[post("/cometd/{version}/handshake")]
async fn handshake(state: web::Data<ServerState>, req: HttpRequest) -> HttpResponse {
    if !authorized(&state, &req) {
        return HttpResponse::Unauthorized().finish();
    }
    state.counters.handshakes.fetch_add(1, Ordering::SeqCst);
    let id = state.client_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let client_id = format!("client-{id:04}");
    state
        .clients
        .lock()
        .unwrap()
        .insert(client_id.clone(), ClientSession::default());
    debug!(client_id, "handshake accepted");
    HttpResponse::Ok().json(serde_json::json!({
        "successful": true,
        "clientId": client_id
    }))
}

/// POST /cometd/{version}/subscribe
#[post("/cometd/{version}/subscribe")]
async fn subscribe(
    state: web::Data<ServerState>,
    req: HttpRequest,
    body: web::Json<SubscribeBody>,
) -> HttpResponse {
    if !authorized(&state, &req) {
        return HttpResponse::Unauthorized().finish();
    }
    if state.hold_subscribe.load(Ordering::SeqCst) {
        sleep(Duration::from_secs(60)).await;
        return HttpResponse::Ok().json(serde_json::json!({
            "successful": false,
            "error": "subscribe held by test hook"
        }));
    }

    {
        let mut clients = state.clients.lock().unwrap();
        let Some(session) = clients.get_mut(&body.client_id) else {
            return HttpResponse::Ok().json(serde_json::json!({
                "successful": false,
                "error": "402::unknown client"
            }));
        };
        let logs = state.channel_logs.lock().unwrap();
        let start = logs
            .get(&body.channel)
            .map(|log| start_index(log, body.replay_from))
            .unwrap_or(0);
        session.subscriptions.insert(body.channel.clone(), start);
    }

    *state
        .counters
        .subscribes
        .lock()
        .unwrap()
        .entry(body.channel.clone())
        .or_default() += 1;
    debug!(
        client_id = %body.client_id,
        channel = %body.channel,
        replay_from = body.replay_from,
        "subscribed"
    );
    // Wake pending polls so replayed history is delivered promptly.
    state.wakeup.notify_waiters();
    HttpResponse::Ok().json(serde_json::json!({ "successful": true }))
}

/// POST /cometd/{version}/connect
/// Long poll: answers with pending events immediately, otherwise holds until
/// an event arrives or the keep-alive interval elapses.
#[post("/cometd/{version}/connect")]
async fn connect(
    state: web::Data<ServerState>,
    req: HttpRequest,
    body: web::Json<ClientBody>,
) -> HttpResponse {
    if !authorized(&state, &req) {
        return HttpResponse::Unauthorized().finish();
    }
    let deadline = tokio::time::Instant::now() + state.keep_alive;
    loop {
        let notified = state.wakeup.notified();
        match drain_events(&state, &body.client_id) {
            Drained::UnknownClient => {
                return HttpResponse::Ok().json(serde_json::json!({
                    "successful": false,
                    "error": "402::unknown client"
                }));
            }
            Drained::Events(events) if !events.is_empty() => {
                return HttpResponse::Ok().json(serde_json::json!({
                    "successful": true,
                    "events": events
                }));
            }
            Drained::Events(_) => {
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return HttpResponse::Ok().json(serde_json::json!({
                        "successful": true,
                        "events": []
                    }));
                }
            }
        }
    }
}

/// POST /cometd/{version}/unsubscribe
#[post("/cometd/{version}/unsubscribe")]
async fn unsubscribe(
    state: web::Data<ServerState>,
    req: HttpRequest,
    body: web::Json<UnsubscribeBody>,
) -> HttpResponse {
    if !authorized(&state, &req) {
        return HttpResponse::Unauthorized().finish();
    }
    if let Some(session) = state.clients.lock().unwrap().get_mut(&body.client_id) {
        session.subscriptions.remove(&body.channel);
    }
    HttpResponse::Ok().json(serde_json::json!({ "successful": true }))
}

/// POST /cometd/{version}/disconnect
#[post("/cometd/{version}/disconnect")]
async fn disconnect(
    state: web::Data<ServerState>,
    req: HttpRequest,
    body: web::Json<ClientBody>,
) -> HttpResponse {
    if !authorized(&state, &req) {
        return HttpResponse::Unauthorized().finish();
    }
    state.clients.lock().unwrap().remove(&body.client_id);
    debug!(client_id = %body.client_id, "disconnected");
    HttpResponse::Ok().json(serde_json::json!({ "successful": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InjectBody {
    channel: String,
    change_type: String,
    entity_name: String,
    #[serde(default)]
    record_id: String,
    #[serde(default)]
    changed_fields: serde_json::Map<String, serde_json::Value>,
}

/// POST /api/event
/// Test hook: publishes a change event without authentication.
#[post("/api/event")]
async fn inject_event(state: web::Data<ServerState>, body: web::Json<InjectBody>) -> HttpResponse {
    let body = body.into_inner();
    let replay_id = publish_event(
        &state,
        &body.channel,
        &body.change_type,
        &body.entity_name,
        &body.record_id,
        body.changed_fields,
    );
    HttpResponse::Ok().json(serde_json::json!({ "replayId": replay_id }))
}
