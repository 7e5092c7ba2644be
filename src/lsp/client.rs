// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! One connection to one language-server backend.
//!
//! A [`Client`] never blocks. Outbound requests register a continuation keyed
//! by request id and return immediately; the owner feeds decoded frames back
//! through [`Client::handle_message`] as they arrive, and the matching
//! continuation runs then. Lifecycle changes that the owner must react to are
//! queued as [`ClientEvent`]s and collected with [`Client::take_events`].

use lsp_types::{
    ClientCapabilities, ClientInfo, Diagnostic, GeneralClientCapabilities, InitializeParams,
    InitializeResult, LogMessageParams, MessageType, PositionEncodingKind, ProgressParams,
    PublishDiagnosticsParams, ServerCapabilities, Uri, WindowClientCapabilities,
    WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

use super::error::{ClientError, TransportError};
use super::protocol::{
    self, IncomingMessage, METHOD_NOT_FOUND, NotificationMessage, RequestId, RequestMessage,
    ResponseError, ResponseMessage,
};
use super::state::{ClientState, ClientStatus, ProgressChange, ProgressTracker};
use super::transport::{ClientId, DeliverySender, Inbox, Transport};

/// Restarts granted to a client before it is retired for good.
pub const DEFAULT_RESTART_BUDGET: u32 = 5;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// What a response continuation receives.
pub type ResponseResult = Result<Value, ResponseError>;
/// Continuation run once when the matching response arrives.
///
/// It is dropped without being called if the request is cancelled or the
/// connection goes away first.
pub type ResponseHandler = Box<dyn FnOnce(ResponseResult)>;
/// Handler for one notification method.
pub type NotificationHandler = Box<dyn FnMut(&Value)>;

/// Per-backend settings that survive restarts.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Workspace root announced in `initialize`.
    pub root: PathBuf,
    /// Passed verbatim as `initializationOptions`.
    pub initialization_options: Option<Value>,
    /// Number of automatic restarts allowed.
    pub restart_budget: u32,
}

impl ClientSettings {
    /// Settings for a workspace rooted at `root`.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self {
            root,
            initialization_options: None,
            restart_budget: DEFAULT_RESTART_BUDGET,
        }
    }
}

/// Lifecycle notifications for the client's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The handshake completed.
    Initialized,
    /// The transport session ended (shutdown, crash or error). Sent once per
    /// session.
    Finished,
}

/// How an incoming frame was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A pending request was completed.
    Response(RequestId),
    /// A response for an id that is not pending (cancelled, late or unknown).
    Stale(RequestId),
    /// A notification was dispatched.
    Notification(String),
    /// A server-to-client request was answered.
    ServerRequest(String),
    /// The frame could not be used.
    Dropped,
}

enum Pending {
    Initialize,
    Shutdown,
    Caller {
        method: String,
        handler: ResponseHandler,
    },
}

/// Connection to one backend over one [`Transport`].
pub struct Client {
    id: ClientId,
    name: String,
    settings: ClientSettings,
    state: ClientState,
    transport: Box<dyn Transport>,
    session: u64,
    next_request: i64,
    pending: HashMap<RequestId, Pending>,
    capabilities: Option<ServerCapabilities>,
    encoding: PositionEncodingKind,
    notification_handlers: HashMap<String, NotificationHandler>,
    progress: ProgressTracker,
    diagnostics: HashMap<Uri, Vec<Diagnostic>>,
    restarts_left: u32,
    finished: bool,
    events: VecDeque<ClientEvent>,
}

/// `file://` URI for `root`, percent-encoded.
fn root_uri(root: &Path) -> Result<Uri, String> {
    let url = url::Url::from_file_path(root)
        .map_err(|()| format!("root path {} is not absolute", root.display()))?;
    url.as_str()
        .parse()
        .map_err(|e| format!("invalid root URI {url}: {e}"))
}

impl Client {
    /// Creates an unstarted client.
    #[must_use]
    pub fn new(name: &str, transport: Box<dyn Transport>, settings: ClientSettings) -> Self {
        Self {
            id: ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.to_string(),
            restarts_left: settings.restart_budget,
            settings,
            state: ClientState::Uninitialized,
            transport,
            session: 0,
            next_request: 1,
            pending: HashMap::new(),
            capabilities: None,
            encoding: PositionEncodingKind::UTF16,
            notification_handlers: HashMap::new(),
            progress: ProgressTracker::default(),
            diagnostics: HashMap::new(),
            finished: false,
            events: VecDeque::new(),
        }
    }

    /// Identity inside the owning manager.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// True iff the handshake completed and shutdown has not begun.
    #[must_use]
    pub const fn reachable(&self) -> bool {
        self.state.is_reachable()
    }

    /// Capabilities negotiated during the handshake.
    #[must_use]
    pub const fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.as_ref()
    }

    /// Position encoding the backend chose.
    #[must_use]
    pub fn encoding(&self) -> PositionEncodingKind {
        self.encoding.clone()
    }

    /// Current transport session; bumped by every `start`.
    #[must_use]
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Restarts still available.
    #[must_use]
    pub const fn restarts_left(&self) -> u32 {
        self.restarts_left
    }

    /// Whether `id` is waiting for a response.
    #[must_use]
    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of requests waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Latest diagnostics the backend published for `uri`.
    #[must_use]
    pub fn diagnostics(&self, uri: &Uri) -> &[Diagnostic] {
        self.diagnostics.get(uri).map_or(&[], Vec::as_slice)
    }

    /// Snapshot for status displays.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        let progress = self.progress.primary();
        ClientStatus {
            name: self.name.clone(),
            state: self.state,
            pending_requests: self.pending.len(),
            restarts_left: self.restarts_left,
            progress_title: progress.map(|p| p.title.clone()),
            progress_percentage: progress.and_then(|p| p.percentage),
        }
    }

    /// Describes the transport for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Routes notifications with `method` to `handler` instead of the
    /// built-in handling. A later registration replaces an earlier one.
    pub fn on_notification(&mut self, method: &str, handler: impl FnMut(&Value) + 'static) {
        self.notification_handlers
            .insert(method.to_string(), Box::new(handler));
    }

    /// Drains queued lifecycle events, oldest first.
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    /// Opens the transport and begins a new session. Sends nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be launched.
    pub fn start(&mut self, sink: &DeliverySender) -> Result<(), TransportError> {
        self.session += 1;
        self.finished = false;
        let inbox = Inbox::new(self.id, self.session, sink.clone());
        self.transport.start(inbox)?;
        info!("Started {} ({})", self.name, self.transport.describe());
        Ok(())
    }

    /// Sends the `initialize` handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not `Uninitialized`, or if the
    /// request cannot be written (the client is then in `Error`).
    pub fn initialize(&mut self) -> Result<(), ClientError> {
        self.expect_state(ClientState::Uninitialized, "initialize")?;

        let params = serde_json::to_value(self.initialize_params())?;
        let id = self.allocate_id();
        if let Err(e) = self.send_tracked(id, "initialize", params, Pending::Initialize) {
            self.set_error(&format!("could not send initialize: {e}"));
            return Err(e);
        }

        self.advance(ClientState::InitializeRequested);
        Ok(())
    }

    /// Asks the backend to shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not reachable or the request cannot
    /// be written.
    pub fn shutdown(&mut self) -> Result<(), ClientError> {
        self.expect_state(ClientState::Initialized, "shut down")?;

        let id = self.allocate_id();
        self.send_tracked(id, "shutdown", Value::Null, Pending::Shutdown)?;
        self.advance(ClientState::ShutdownRequested);
        info!("Requested shutdown of {}", self.name);
        Ok(())
    }

    /// Sends a request under a freshly allocated id.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is not reachable or the transport is not
    /// writable; no continuation is registered in that case.
    pub fn send_request(
        &mut self,
        method: &str,
        params: Value,
        handler: ResponseHandler,
    ) -> Result<RequestId, ClientError> {
        let id = self.allocate_id();
        self.send_request_with_id(id.clone(), method, params, handler)?;
        Ok(id)
    }

    /// Sends a request under an id chosen by the caller.
    ///
    /// Used for requests that share one id across several clients.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DuplicateRequestId`] if `id` is already pending,
    /// and the same errors as [`Client::send_request`] otherwise.
    pub fn send_request_with_id(
        &mut self,
        id: RequestId,
        method: &str,
        params: Value,
        handler: ResponseHandler,
    ) -> Result<(), ClientError> {
        self.expect_state(ClientState::Initialized, "send requests")?;

        let result = self.send_tracked(
            id,
            method,
            params,
            Pending::Caller {
                method: method.to_string(),
                handler,
            },
        );
        if let Err(e) = &result {
            warn!("{}: {} not sent: {}", self.name, method, e);
        }
        result
    }

    /// Sends a notification. Failures are logged, not returned.
    pub fn send_notification(&mut self, method: &str, params: Value) {
        if !self.reachable() {
            debug!(
                "{}: not sending {} while {}",
                self.name, method, self.state
            );
            return;
        }
        self.notify(method, params);
    }

    /// Tells the backend the result of `id` is no longer wanted.
    ///
    /// The local continuation is dropped immediately, so a late response is
    /// ignored. Handshake and shutdown requests cannot be cancelled.
    pub fn cancel_request(&mut self, id: &RequestId) {
        if matches!(
            self.pending.get(id),
            Some(Pending::Initialize | Pending::Shutdown)
        ) {
            warn!("{}: refusing to cancel lifecycle request {}", self.name, id);
            return;
        }

        match self.pending.remove(id) {
            Some(Pending::Caller { method, .. }) => {
                debug!("{}: cancelled {} ({})", self.name, method, id);
            }
            _ => trace!("{}: cancel for {} which is not pending", self.name, id),
        }
        self.notify("$/cancelRequest", json!({ "id": id }));
    }

    /// Dispatches one decoded frame.
    pub fn handle_message(&mut self, raw: &[u8]) -> MessageOutcome {
        let message = match IncomingMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                if self.answers_initialize(raw) {
                    self.set_error(&format!("malformed initialize response: {e}"));
                } else {
                    warn!("{}: dropping frame: {}", self.name, e);
                }
                return MessageOutcome::Dropped;
            }
        };

        match message {
            IncomingMessage::Response(response) => self.handle_response(response),
            IncomingMessage::Request(request) => {
                let method = request.method.clone();
                self.handle_server_request(request);
                MessageOutcome::ServerRequest(method)
            }
            IncomingMessage::Notification(notification) => {
                self.handle_notification(&notification);
                MessageOutcome::Notification(notification.method)
            }
        }
    }

    /// Records that the transport stopped delivering frames.
    pub fn transport_closed(&mut self, reason: &impl std::fmt::Display) {
        if self.finished {
            trace!("{}: transport closed after finish", self.name);
            return;
        }

        if self.state.is_deliberate_shutdown() {
            info!("{}: backend exited", self.name);
        } else {
            warn!("{}: backend unexpectedly finished ({})", self.name, reason);
            if self.state != ClientState::Error {
                self.advance(ClientState::Error);
            }
        }
        self.transport.close();
        self.finish();
    }

    /// Prepares the client for another session.
    ///
    /// Consumes one unit of restart budget and returns `false` once none is
    /// left. On success the client is `Uninitialized` again and must be
    /// started.
    pub fn reset(&mut self) -> bool {
        if self.restarts_left == 0 {
            return false;
        }
        self.restarts_left -= 1;

        self.transport.close();
        self.drop_pending();
        self.state = ClientState::Uninitialized;
        self.capabilities = None;
        self.encoding = PositionEncodingKind::UTF16;
        self.progress.clear();
        self.diagnostics.clear();
        self.finished = false;
        debug!(
            "{}: reset, {} restart(s) left",
            self.name, self.restarts_left
        );
        true
    }

    /// Releases the transport for good. No events are emitted.
    pub fn close(&mut self) {
        self.transport.close();
        self.drop_pending();
    }

    fn expect_state(
        &self,
        expected: ClientState,
        operation: &'static str,
    ) -> Result<(), ClientError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ClientError::InvalidState {
                client: self.name.clone(),
                operation,
                state: self.state,
            })
        }
    }

    fn advance(&mut self, next: ClientState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!("{}: {} -> {}", self.name, self.state, next);
        self.state = next;
    }

    fn allocate_id(&mut self) -> RequestId {
        let id = RequestId::Number(self.next_request);
        self.next_request += 1;
        id
    }

    fn initialize_params(&self) -> InitializeParams {
        let root = &self.settings.root;
        let workspace_folders = match root_uri(root) {
            Ok(uri) => Some(vec![WorkspaceFolder {
                uri,
                name: root
                    .file_name()
                    .map_or_else(|| "workspace".to_string(), |s| s.to_string_lossy().to_string()),
            }]),
            Err(e) => {
                warn!("{}: {}", self.name, e);
                None
            }
        };

        InitializeParams {
            process_id: Some(std::process::id()),
            capabilities: ClientCapabilities {
                general: Some(GeneralClientCapabilities {
                    position_encodings: Some(vec![
                        PositionEncodingKind::UTF8,
                        PositionEncodingKind::UTF16,
                    ]),
                    ..Default::default()
                }),
                window: Some(WindowClientCapabilities {
                    work_done_progress: Some(true),
                    ..Default::default()
                }),
                workspace: Some(WorkspaceClientCapabilities {
                    workspace_folders: Some(true),
                    configuration: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            },
            workspace_folders,
            initialization_options: self.settings.initialization_options.clone(),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        }
    }

    fn send_content<T: Serialize>(&mut self, message: &T) -> Result<(), ClientError> {
        let frame = protocol::encode_message(message)?;
        if !self.transport.is_writable() {
            return Err(TransportError::Closed.into());
        }
        self.transport.send(frame)?;
        Ok(())
    }

    fn send_tracked(
        &mut self,
        id: RequestId,
        method: &str,
        params: Value,
        pending: Pending,
    ) -> Result<(), ClientError> {
        if self.pending.contains_key(&id) {
            return Err(ClientError::DuplicateRequestId(id));
        }

        trace!("{}: -> {} ({})", self.name, method, id);
        self.send_content(&RequestMessage::new(id.clone(), method, params))?;
        self.pending.insert(id, pending);
        Ok(())
    }

    fn notify(&mut self, method: &str, params: Value) {
        trace!("{}: -> {}", self.name, method);
        if let Err(e) = self.send_content(&NotificationMessage::new(method, params)) {
            warn!("{}: {} not sent: {}", self.name, method, e);
        }
    }

    fn handle_response(&mut self, response: ResponseMessage) -> MessageOutcome {
        let Some(id) = response.id.clone() else {
            warn!(
                "{}: response without id: {:?}",
                self.name, response.error
            );
            return MessageOutcome::Dropped;
        };

        match self.pending.remove(&id) {
            None => {
                debug!("{}: ignoring response for {} (not pending)", self.name, id);
                MessageOutcome::Stale(id)
            }
            Some(Pending::Initialize) => {
                self.on_initialize_response(response);
                MessageOutcome::Response(id)
            }
            Some(Pending::Shutdown) => {
                self.on_shutdown_response(response);
                MessageOutcome::Response(id)
            }
            Some(Pending::Caller { method, handler }) => {
                if let Some(error) = &response.error {
                    debug!("{}: {} failed: {}", self.name, method, error);
                }
                handler(response.into_result());
                MessageOutcome::Response(id)
            }
        }
    }

    /// Whether an unparseable frame still carries the id of the pending
    /// `initialize` request.
    fn answers_initialize(&self, raw: &[u8]) -> bool {
        let Ok(value) = serde_json::from_slice::<Value>(raw) else {
            return false;
        };
        if value.get("method").is_some() {
            return false;
        }
        value
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok())
            .is_some_and(|id| matches!(self.pending.get(&id), Some(Pending::Initialize)))
    }

    fn on_initialize_response(&mut self, response: ResponseMessage) {
        let result = match response.into_result() {
            Ok(result) => result,
            Err(error) => {
                self.set_error(&format!("initialize rejected: {error}"));
                return;
            }
        };

        let result: InitializeResult = match serde_json::from_value(result) {
            Ok(result) => result,
            Err(e) => {
                self.set_error(&format!("malformed initialize response: {e}"));
                return;
            }
        };

        if let Some(server) = &result.server_info {
            info!(
                "{}: connected to {} {}",
                self.name,
                server.name,
                server.version.as_deref().unwrap_or("")
            );
        }
        if let Some(encoding) = &result.capabilities.position_encoding {
            self.encoding = encoding.clone();
        }
        self.capabilities = Some(result.capabilities);
        self.advance(ClientState::Initialized);
        self.notify("initialized", json!({}));
        self.events.push_back(ClientEvent::Initialized);
    }

    fn on_shutdown_response(&mut self, response: ResponseMessage) {
        if let Err(error) = response.into_result() {
            warn!("{}: shutdown answered with {}; exiting anyway", self.name, error);
        }
        self.advance(ClientState::Shutdown);
        self.notify("exit", Value::Null);
        self.transport.close();
        info!("{}: shut down", self.name);
        self.finish();
    }

    fn handle_server_request(&mut self, request: RequestMessage) {
        debug!("{}: server request {} ({})", self.name, request.method, request.id);

        let reply = match request.method.as_str() {
            "workspace/workspaceFolders" => {
                let folders = self
                    .initialize_params()
                    .workspace_folders
                    .and_then(|folders| serde_json::to_value(folders).ok())
                    .unwrap_or(Value::Null);
                Ok(folders)
            }
            "workspace/configuration" => {
                // One `null` per requested item: no settings on our side.
                let items = request
                    .params
                    .get("items")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                Ok(Value::Array(vec![Value::Null; items]))
            }
            "window/workDoneProgress/create"
            | "client/registerCapability"
            | "client/unregisterCapability" => Ok(Value::Null),
            "window/showMessageRequest" => {
                self.log_server_message(&request.params);
                Ok(Value::Null)
            }
            "workspace/applyWorkspaceEdit" => Ok(json!({
                "applied": false,
                "failureReason": "workspace edits are not supported by this client"
            })),
            method => Err(format!("Method '{method}' not supported by client")),
        };

        let response = match reply {
            Ok(result) => ResponseMessage::success(request.id, result),
            Err(message) => ResponseMessage::failure(request.id, METHOD_NOT_FOUND, message),
        };
        if let Err(e) = self.send_content(&response) {
            warn!("{}: reply to {} not sent: {}", self.name, request.method, e);
        }
    }

    fn handle_notification(&mut self, notification: &NotificationMessage) {
        if let Some(handler) = self.notification_handlers.get_mut(&notification.method) {
            handler(&notification.params);
            return;
        }

        match notification.method.as_str() {
            "window/logMessage" | "window/showMessage" => {
                self.log_server_message(&notification.params);
            }
            "$/progress" => {
                match serde_json::from_value::<ProgressParams>(notification.params.clone()) {
                    Ok(params) => match self.progress.apply(&params) {
                        ProgressChange::Began(title) => debug!("{}: {} started", self.name, title),
                        ProgressChange::Ended(title) => debug!("{}: {} done", self.name, title),
                        ProgressChange::Reported(_) | ProgressChange::Unknown => {}
                    },
                    Err(e) => warn!("{}: malformed progress notification: {}", self.name, e),
                }
            }
            "textDocument/publishDiagnostics" => {
                match serde_json::from_value::<PublishDiagnosticsParams>(
                    notification.params.clone(),
                ) {
                    Ok(params) => {
                        debug!(
                            "{}: {} diagnostics for {}",
                            self.name,
                            params.diagnostics.len(),
                            params.uri.as_str()
                        );
                        self.diagnostics.insert(params.uri, params.diagnostics);
                    }
                    Err(e) => warn!("{}: malformed publishDiagnostics: {}", self.name, e),
                }
            }
            method => debug!(
                "{}: unhandled notification {} params={}",
                self.name, method, notification.params
            ),
        }
    }

    fn log_server_message(&self, params: &Value) {
        let Ok(message) = serde_json::from_value::<LogMessageParams>(params.clone()) else {
            debug!("{}: server message {}", self.name, params);
            return;
        };

        if message.typ == MessageType::ERROR {
            error!("{}: {}", self.name, message.message);
        } else if message.typ == MessageType::WARNING {
            warn!("{}: {}", self.name, message.message);
        } else if message.typ == MessageType::INFO {
            info!("{}: {}", self.name, message.message);
        } else {
            debug!("{}: {}", self.name, message.message);
        }
    }

    fn set_error(&mut self, message: &str) {
        error!("{}: {}", self.name, message);
        if self.state != ClientState::Error {
            self.advance(ClientState::Error);
        }
        self.transport.close();
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.drop_pending();
        self.events.push_back(ClientEvent::Finished);
    }

    fn drop_pending(&mut self) {
        let abandoned = self
            .pending
            .drain()
            .filter(|(_, pending)| matches!(pending, Pending::Caller { .. }))
            .count();
        if abandoned > 0 {
            debug!("{}: abandoned {} pending request(s)", self.name, abandoned);
        }
    }
}
