//! The protocol endpoint: a pool of authenticated connections keyed by
//! instance, with a {stopped, running, suspended} service lifecycle and a
//! periodic cleanup tick for deferred connection teardown.

use crate::errors::{Error, Result};
use crate::protocol::auth;
use crate::protocol::connection::{ProtocolConnection, QuicConnection, QuicStream, StreamManager};
use crate::protocol::demux::{MessageCallback, MessageCallbackHandle, MessageDemuxer, MessageWatch};
use crate::protocol::messages::*;
use crate::runner::{Alarm, TaskRunner};
use ciborium::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Whether this endpoint answers or initiates authentication.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Service lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Stopped,
    Running,
    Suspended,
}

/// Cadence of the deferred-deletion tick while the service is not
/// stopped.
pub const CLEANUP_PERIOD: Duration = Duration::from_millis(500);

/// Observes service lifecycle and connection events.
pub trait EndpointObserver: Send {
    fn on_running(&mut self) {}
    fn on_stopped(&mut self) {}
    fn on_suspended(&mut self) {}

    /// A peer opened a new post-authentication stream.
    fn on_incoming_connection(&mut self, _connection: ProtocolConnection) {}

    fn on_connection_authenticated(&mut self, _instance_id: u64, _instance_name: &str) {}
    fn on_authentication_failed(&mut self, _instance_id: u64, _error: &Error) {}
}

pub type EndpointObserverHandle = Arc<Mutex<dyn EndpointObserver>>;

/// Notified about the outcome of a connect request.
pub trait ConnectRequestCallback: Send {
    fn on_connect_succeeded(&mut self, request_id: u64, instance_name: &str, instance_id: u64);
    fn on_connect_failed(&mut self, request_id: u64, instance_name: &str);
}

pub type ConnectCallbackHandle = Arc<Mutex<dyn ConnectRequestCallback>>;

/// Allocates message request ids per instance. Clients use even ids and
/// servers odd ones, so the two sides never collide on one connection.
pub struct InstanceRequestIds {
    role: Role,
    next: HashMap<u64, u64>,
}

impl InstanceRequestIds {
    pub fn new(role: Role) -> InstanceRequestIds {
        InstanceRequestIds {
            role,
            next: HashMap::new(),
        }
    }

    pub fn next_request_id(&mut self, instance_id: u64) -> u64 {
        let base = match self.role {
            Role::Client => 0,
            Role::Server => 1,
        };
        let next = self.next.entry(instance_id).or_insert(base);
        let id = *next;
        *next += 2;
        id
    }

    pub fn reset(&mut self, instance_id: u64) {
        self.next.remove(&instance_id);
    }

    pub fn reset_all(&mut self) {
        self.next.clear();
    }
}

struct PendingConnection {
    manager: StreamManager,
    callbacks: Vec<(u64, ConnectCallbackHandle)>,
}

struct AuthenticatingConnection {
    manager: StreamManager,
    callbacks: Vec<(u64, ConnectCallbackHandle)>,
    private_key: [u8; auth::PRIVATE_KEY_LEN],
    shared_key: Option<[u8; auth::SHARED_KEY_LEN]>,
    /// The stream this side sends its authentication messages on.
    auth_stream: Option<Box<dyn QuicStream>>,
    /// The peer's first incoming stream, carrying its authentication
    /// messages.
    incoming_auth_stream: Option<Box<dyn QuicStream>>,
    /// Demuxer watches alive for the duration of authentication.
    _watches: Vec<MessageWatch>,
}

struct ConnectionData {
    manager: StreamManager,
}

enum Notice {
    Running,
    Stopped,
    Suspended,
    Incoming(ProtocolConnection),
    Authenticated {
        instance_id: u64,
        instance_name: String,
    },
    AuthFailed {
        instance_id: u64,
        reason: String,
    },
    ConnectSucceeded {
        callback: ConnectCallbackHandle,
        request_id: u64,
        instance_name: String,
        instance_id: u64,
    },
    ConnectFailed {
        callback: ConnectCallbackHandle,
        request_id: u64,
        instance_name: String,
    },
}

struct EndpointInner {
    role: Role,
    state: EndpointState,
    password: Vec<u8>,
    demuxer: MessageDemuxer,
    pending_connections: HashMap<String, PendingConnection>,
    pending_authentications: HashMap<u64, AuthenticatingConnection>,
    connections: HashMap<u64, ConnectionData>,
    instance_map: HashMap<String, u64>,
    delete_connections: Vec<u64>,
    request_ids: InstanceRequestIds,
    next_instance_id: u64,
    next_connect_request_id: u64,
    observer: Option<EndpointObserverHandle>,
}

impl EndpointInner {
    fn find_instance_name(&self, instance_id: u64) -> Option<String> {
        self.instance_map
            .iter()
            .find(|(_, &id)| id == instance_id)
            .map(|(name, _)| name.clone())
    }

    /// Tears down one authenticating connection, failing its callbacks.
    fn fail_authentication(&mut self, instance_id: u64, reason: String) -> Vec<Notice> {
        let mut notices = Vec::new();
        let Some(mut conn) = self.pending_authentications.remove(&instance_id) else {
            return notices;
        };
        let instance_name = conn.manager.instance_name().to_string();
        conn.manager.close();
        self.instance_map.remove(&instance_name);
        self.request_ids.reset(instance_id);
        self.demuxer.drop_instance(instance_id);

        for (request_id, callback) in conn.callbacks {
            notices.push(Notice::ConnectFailed {
                callback,
                request_id,
                instance_name: instance_name.clone(),
            });
        }
        notices.push(Notice::AuthFailed {
            instance_id,
            reason,
        });
        notices
    }

    /// Moves an authenticated connection into the active pool.
    fn finish_authentication(&mut self, instance_id: u64) -> Vec<Notice> {
        let mut notices = Vec::new();
        let Some(conn) = self.pending_authentications.remove(&instance_id) else {
            return notices;
        };
        let instance_name = conn.manager.instance_name().to_string();

        for (request_id, callback) in conn.callbacks {
            notices.push(Notice::ConnectSucceeded {
                callback,
                request_id,
                instance_name: instance_name.clone(),
                instance_id,
            });
        }
        notices.push(Notice::Authenticated {
            instance_id,
            instance_name,
        });

        self.connections.insert(
            instance_id,
            ConnectionData {
                manager: conn.manager,
            },
        );
        notices
    }

    fn close_all_connections(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();

        for (name, mut pending) in self.pending_connections.drain() {
            pending.manager.close();
            for (request_id, callback) in pending.callbacks {
                notices.push(Notice::ConnectFailed {
                    callback,
                    request_id,
                    instance_name: name.clone(),
                });
            }
        }

        let authenticating: Vec<u64> = self.pending_authentications.keys().copied().collect();
        for instance_id in authenticating {
            let mut conn = self.pending_authentications.remove(&instance_id).unwrap();
            let name = conn.manager.instance_name().to_string();
            conn.manager.close();
            for (request_id, callback) in conn.callbacks {
                notices.push(Notice::ConnectFailed {
                    callback,
                    request_id,
                    instance_name: name.clone(),
                });
            }
        }

        for (_, mut conn) in self.connections.drain() {
            conn.manager.close();
        }

        self.instance_map.clear();
        self.delete_connections.clear();
        self.request_ids.reset_all();
        self.next_instance_id = 1;
        notices
    }
}

/// See the module documentation. Clone for cross-layer handles; all
/// clones share one state block.
#[derive(Clone)]
pub struct ProtocolEndpoint {
    inner: Arc<Mutex<EndpointInner>>,
    cleanup_alarm: Arc<Alarm>,
}

struct AuthReceiver {
    endpoint: ProtocolEndpoint,
}

impl MessageCallback for AuthReceiver {
    fn on_message(
        &mut self,
        instance_id: u64,
        _stream_id: u64,
        message_type: MessageType,
        body: &Value,
    ) {
        match message_type {
            MessageType::AuthSpake2Handshake => {
                self.endpoint.handle_auth_handshake(instance_id, body)
            }
            MessageType::AuthSpake2Confirmation => {
                self.endpoint.handle_auth_confirmation(instance_id, body)
            }
            MessageType::AuthStatus => self.endpoint.handle_auth_status(instance_id, body),
            _ => {}
        }
    }
}

impl ProtocolEndpoint {
    pub fn new(
        role: Role,
        password: impl Into<Vec<u8>>,
        runner: TaskRunner,
        observer: Option<EndpointObserverHandle>,
    ) -> ProtocolEndpoint {
        ProtocolEndpoint {
            inner: Arc::new(Mutex::new(EndpointInner {
                role,
                state: EndpointState::Stopped,
                password: password.into(),
                demuxer: MessageDemuxer::default(),
                pending_connections: HashMap::new(),
                pending_authentications: HashMap::new(),
                connections: HashMap::new(),
                instance_map: HashMap::new(),
                delete_connections: Vec::new(),
                request_ids: InstanceRequestIds::new(role),
                next_instance_id: 1,
                next_connect_request_id: 0,
                observer,
            })),
            cleanup_alarm: Arc::new(Alarm::new(runner)),
        }
    }

    pub fn state(&self) -> EndpointState {
        self.inner.lock().state
    }

    pub fn demuxer(&self) -> MessageDemuxer {
        self.inner.lock().demuxer.clone()
    }

    pub fn start(&self) -> bool {
        let notices = {
            let mut inner = self.inner.lock();
            if inner.state != EndpointState::Stopped {
                return false;
            }
            inner.state = EndpointState::Running;
            vec![Notice::Running]
        };
        self.schedule_cleanup();
        self.emit(notices);
        true
    }

    pub fn stop(&self) -> bool {
        let notices = {
            let mut inner = self.inner.lock();
            if inner.state != EndpointState::Running && inner.state != EndpointState::Suspended {
                return false;
            }
            let mut notices = inner.close_all_connections();
            inner.state = EndpointState::Stopped;
            notices.push(Notice::Stopped);
            notices
        };
        self.cleanup_alarm.cancel();
        self.emit(notices);
        true
    }

    pub fn suspend(&self) -> bool {
        let notices = {
            let mut inner = self.inner.lock();
            if inner.state != EndpointState::Running {
                return false;
            }
            inner.state = EndpointState::Suspended;
            vec![Notice::Suspended]
        };
        self.emit(notices);
        true
    }

    pub fn resume(&self) -> bool {
        let notices = {
            let mut inner = self.inner.lock();
            if inner.state != EndpointState::Suspended {
                return false;
            }
            inner.state = EndpointState::Running;
            vec![Notice::Running]
        };
        self.emit(notices);
        true
    }

    /// Starts connecting to a peer. The transport connection is handed in
    /// pre-handshake; `callback` resolves once authentication completes.
    /// Returns the connect request id.
    pub fn connect(
        &self,
        connection: Box<dyn QuicConnection>,
        callback: ConnectCallbackHandle,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.state != EndpointState::Running {
            return Err(Error::OperationInvalid);
        }

        let instance_name = connection.instance_name().to_string();
        inner.next_connect_request_id += 1;
        let request_id = inner.next_connect_request_id;

        if let Some(pending) = inner.pending_connections.get_mut(&instance_name) {
            pending.callbacks.push((request_id, callback));
            return Ok(request_id);
        }

        inner.pending_connections.insert(
            instance_name,
            PendingConnection {
                manager: StreamManager::new(connection),
                callbacks: vec![(request_id, callback)],
            },
        );
        Ok(request_id)
    }

    /// Adopts an incoming transport connection (server side); it proceeds
    /// through the same handshake-then-authenticate pipeline with no
    /// connect callbacks.
    pub fn on_incoming_connection(&self, connection: Box<dyn QuicConnection>) {
        let mut inner = self.inner.lock();
        if inner.state != EndpointState::Running {
            return;
        }
        let instance_name = connection.instance_name().to_string();
        inner
            .pending_connections
            .entry(instance_name)
            .or_insert_with(|| PendingConnection {
                manager: StreamManager::new(connection),
                callbacks: Vec::new(),
            });
    }

    /// Called when the transport reports crypto-handshake completion.
    /// Allocates the instance id, installs the authentication watches, and
    /// (on the server) initiates the exchange. Returns 0 if the connection
    /// is unknown or the service is not running.
    pub fn on_crypto_handshake_complete(&self, instance_name: &str) -> u64 {
        let mut inner = self.inner.lock();
        if inner.state != EndpointState::Running {
            return 0;
        }
        let Some(pending) = inner.pending_connections.remove(instance_name) else {
            return 0;
        };

        let instance_id = inner.next_instance_id;
        inner.next_instance_id += 1;
        inner.instance_map.insert(instance_name.to_string(), instance_id);

        let receiver: MessageCallbackHandle = Arc::new(Mutex::new(AuthReceiver {
            endpoint: self.clone(),
        }));
        let mut watches = Vec::new();
        let handshake_watch = inner.demuxer.watch_message_type(
            instance_id,
            MessageType::AuthSpake2Handshake,
            receiver.clone(),
        );
        let second_watch = match inner.role {
            Role::Server => inner.demuxer.watch_message_type(
                instance_id,
                MessageType::AuthStatus,
                receiver,
            ),
            Role::Client => inner.demuxer.watch_message_type(
                instance_id,
                MessageType::AuthSpake2Confirmation,
                receiver,
            ),
        };
        match (handshake_watch, second_watch) {
            (Ok(first), Ok(second)) => {
                watches.push(first);
                watches.push(second);
            }
            _ => {
                log::error!("duplicate authentication watches for instance {}", instance_id);
                return 0;
            }
        }

        let mut conn = AuthenticatingConnection {
            manager: pending.manager,
            callbacks: pending.callbacks,
            private_key: auth::generate_private_key(),
            shared_key: None,
            auth_stream: None,
            incoming_auth_stream: None,
            _watches: watches,
        };

        // The server initiates the authentication exchange.
        if inner.role == Role::Server {
            if let Err(e) = send_handshake(&mut conn) {
                log::error!("failed to initiate authentication: {}", e);
            }
        }

        inner.pending_authentications.insert(instance_id, conn);
        instance_id
    }

    /// Routes an incoming stream: the first stream of a connection carries
    /// the peer's authentication messages; later streams surface to the
    /// embedder as protocol connections.
    pub fn on_incoming_stream(&self, instance_id: u64, stream: Box<dyn QuicStream>) {
        let notices = {
            let mut inner = self.inner.lock();
            if inner.state != EndpointState::Running {
                return;
            }

            if let Some(conn) = inner.pending_authentications.get_mut(&instance_id) {
                conn.incoming_auth_stream = Some(stream);
                return;
            }

            match inner.connections.get_mut(&instance_id) {
                Some(conn) => {
                    let connection = conn.manager.adopt_incoming_stream(instance_id, stream);
                    vec![Notice::Incoming(connection)]
                }
                None => return,
            }
        };
        self.emit(notices);
    }

    /// Feeds received stream bytes to the demuxer.
    pub fn on_data_received(&self, instance_id: u64, stream_id: u64, bytes: &[u8]) {
        // The demuxer dispatches without holding the endpoint lock, so
        // authentication handlers may re-enter the endpoint.
        let demuxer = {
            let inner = self.inner.lock();
            if inner.state != EndpointState::Running {
                return;
            }
            inner.demuxer.clone()
        };
        if let Err(e) = demuxer.on_stream_data(instance_id, stream_id, bytes) {
            log::warn!(
                "dropping malformed data on stream {}:{}: {}",
                instance_id,
                stream_id,
                e
            );
        }
    }

    /// Reports stream EOF to the demuxer.
    pub fn on_stream_close(&self, instance_id: u64, stream_id: u64) {
        let demuxer = {
            let inner = self.inner.lock();
            if inner.state != EndpointState::Running {
                return;
            }
            inner.demuxer.clone()
        };
        demuxer.on_stream_close(instance_id, stream_id);
    }

    /// Marks a connection for deletion at the next cleanup tick.
    pub fn on_connection_closed(&self, instance_id: u64) {
        let mut inner = self.inner.lock();
        if inner.state != EndpointState::Running {
            return;
        }
        if !inner.pending_authentications.contains_key(&instance_id)
            && !inner.connections.contains_key(&instance_id)
        {
            return;
        }
        inner.delete_connections.push(instance_id);
        inner.request_ids.reset(instance_id);
    }

    /// Opens a new stream on an authenticated connection.
    pub fn create_protocol_connection(&self, instance_id: u64) -> Option<ProtocolConnection> {
        let mut inner = self.inner.lock();
        if inner.state != EndpointState::Running {
            return None;
        }
        let conn = inner.connections.get_mut(&instance_id)?;
        match conn.manager.open_protocol_connection(instance_id) {
            Ok(connection) => Some(connection),
            Err(e) => {
                log::warn!("failed to open stream to instance {}: {}", instance_id, e);
                None
            }
        }
    }

    pub fn instance_id(&self, instance_name: &str) -> Option<u64> {
        self.inner.lock().instance_map.get(instance_name).copied()
    }

    /// Allocates a message request id for a connection.
    pub fn next_request_id(&self, instance_id: u64) -> u64 {
        self.inner.lock().request_ids.next_request_id(instance_id)
    }

    fn handle_auth_handshake(&self, instance_id: u64, body: &Value) {
        let notices = {
            let mut inner = self.inner.lock();
            let role = inner.role;
            let password = inner.password.clone();
            let Some(conn) = inner.pending_authentications.get_mut(&instance_id) else {
                return;
            };

            let result = message_from_body::<AuthSpake2Handshake>(body)
                .map_err(|e| e.to_string())
                .and_then(|handshake| {
                    auth::compute_shared_key(
                        &conn.private_key,
                        &handshake.public_value,
                        &password,
                    )
                    .map_err(|e| e.to_string())
                });

            match result {
                Ok(shared) => {
                    conn.shared_key = Some(shared);
                    let step = match role {
                        // The client answers with its own public value.
                        Role::Client => send_handshake(conn),
                        // The server proves knowledge of the shared key.
                        Role::Server => send_confirmation(conn),
                    };
                    match step {
                        Ok(()) => Vec::new(),
                        Err(e) => {
                            let reason = e.to_string();
                            inner.fail_authentication(instance_id, reason)
                        }
                    }
                }
                Err(reason) => inner.fail_authentication(instance_id, reason),
            }
        };
        self.emit(notices);
    }

    fn handle_auth_confirmation(&self, instance_id: u64, body: &Value) {
        let notices = {
            let mut inner = self.inner.lock();
            let Some(conn) = inner.pending_authentications.get_mut(&instance_id) else {
                return;
            };

            let verdict = match (message_from_body::<AuthSpake2Confirmation>(body), conn.shared_key)
            {
                (Ok(confirmation), Some(shared)) => {
                    confirmation.proof == auth::confirmation_proof(&shared)
                }
                _ => false,
            };

            let status = AuthStatus {
                result: if verdict {
                    AuthStatus::AUTHENTICATED
                } else {
                    AuthStatus::PROOF_INVALID
                },
            };
            if let Err(e) = send_auth_message(conn, &status) {
                let reason = e.to_string();
                inner.fail_authentication(instance_id, reason)
            } else if verdict {
                inner.finish_authentication(instance_id)
            } else {
                inner.fail_authentication(instance_id, "confirmation mismatch".to_string())
            }
        };
        self.emit(notices);
    }

    fn handle_auth_status(&self, instance_id: u64, body: &Value) {
        let notices = {
            let mut inner = self.inner.lock();
            if !inner.pending_authentications.contains_key(&instance_id) {
                return;
            }

            match message_from_body::<AuthStatus>(body) {
                Ok(status) if status.result == AuthStatus::AUTHENTICATED => {
                    inner.finish_authentication(instance_id)
                }
                Ok(_) => {
                    inner.fail_authentication(instance_id, "peer rejected proof".to_string())
                }
                Err(e) => {
                    let reason = e.to_string();
                    inner.fail_authentication(instance_id, reason)
                }
            }
        };
        self.emit(notices);
    }

    /// Finalises deletions queued by [`ProtocolEndpoint::on_connection_closed`]
    /// and re-arms the tick.
    fn cleanup(&self) {
        let mut inner = self.inner.lock();
        let deletions = std::mem::take(&mut inner.delete_connections);
        for instance_id in deletions {
            if let Some(mut conn) = inner.pending_authentications.remove(&instance_id) {
                conn.manager.close();
            }
            if let Some(mut conn) = inner.connections.remove(&instance_id) {
                conn.manager.close();
            }
            if let Some(name) = inner.find_instance_name(instance_id) {
                inner.instance_map.remove(&name);
            }
            inner.demuxer.drop_instance(instance_id);
        }

        if inner.state != EndpointState::Stopped {
            drop(inner);
            self.schedule_cleanup();
        }
    }

    fn schedule_cleanup(&self) {
        let endpoint = self.clone();
        self.cleanup_alarm
            .schedule_from_now(move || endpoint.cleanup(), CLEANUP_PERIOD);
    }

    fn emit(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let observer = self.inner.lock().observer.clone();
        for notice in notices {
            match notice {
                Notice::Running => {
                    if let Some(observer) = &observer {
                        observer.lock().on_running();
                    }
                }
                Notice::Stopped => {
                    if let Some(observer) = &observer {
                        observer.lock().on_stopped();
                    }
                }
                Notice::Suspended => {
                    if let Some(observer) = &observer {
                        observer.lock().on_suspended();
                    }
                }
                Notice::Incoming(connection) => {
                    if let Some(observer) = &observer {
                        observer.lock().on_incoming_connection(connection);
                    }
                }
                Notice::Authenticated {
                    instance_id,
                    instance_name,
                } => {
                    if let Some(observer) = &observer {
                        observer
                            .lock()
                            .on_connection_authenticated(instance_id, &instance_name);
                    }
                }
                Notice::AuthFailed {
                    instance_id,
                    reason,
                } => {
                    if let Some(observer) = &observer {
                        observer
                            .lock()
                            .on_authentication_failed(instance_id, &Error::Authentication(reason));
                    }
                }
                Notice::ConnectSucceeded {
                    callback,
                    request_id,
                    instance_name,
                    instance_id,
                } => {
                    callback
                        .lock()
                        .on_connect_succeeded(request_id, &instance_name, instance_id);
                }
                Notice::ConnectFailed {
                    callback,
                    request_id,
                    instance_name,
                } => {
                    callback.lock().on_connect_failed(request_id, &instance_name);
                }
            }
        }
    }
}

/// Sends this side's public value on the connection's auth stream,
/// opening the stream if needed.
fn send_handshake(conn: &mut AuthenticatingConnection) -> Result<()> {
    let public_value = auth::compute_public_value(&conn.private_key)?;
    send_auth_message(conn, &AuthSpake2Handshake { public_value })
}

fn send_confirmation(conn: &mut AuthenticatingConnection) -> Result<()> {
    let shared = conn
        .shared_key
        .ok_or_else(|| Error::Authentication("no shared key derived".to_string()))?;
    let proof = auth::confirmation_proof(&shared);
    send_auth_message(conn, &AuthSpake2Confirmation { proof })
}

fn send_auth_message<M: TypedMessage>(
    conn: &mut AuthenticatingConnection,
    message: &M,
) -> Result<()> {
    if conn.auth_stream.is_none() {
        conn.auth_stream = Some(conn.manager.open_stream()?);
    }
    let bytes = encode_message(message)?;
    conn.auth_stream
        .as_mut()
        .expect("just opened")
        .write(&bytes)
}
