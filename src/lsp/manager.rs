// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Fleet control: starting, restarting and retiring clients, broadcasting to
//! them, and arbitrating requests that only the first answer may satisfy.
//!
//! The manager is driven from a single task. [`ClientManager::process_next`]
//! waits for either a transport delivery or the earliest timer and handles it
//! to completion before returning, so nothing else ever observes a client set
//! in the middle of an update.

use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::client::{Client, ClientEvent, MessageOutcome, ResponseHandler, ResponseResult};
use super::protocol::RequestId;
use super::state::ClientStatus;
use super::timers::{Timer, TimerQueue};
use super::transport::{ClientId, Delivery, DeliveryReceiver, DeliverySender, TransportEvent};

/// Restart and shutdown timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    /// Delay between an unexpected finish and the restart attempt.
    pub restart_backoff: Duration,
    /// How long a graceful shutdown may take before clients are dropped.
    pub shutdown_timeout: Duration,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

/// Something observers of the fleet may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A client completed its handshake.
    ClientInitialized {
        /// The client.
        client: ClientId,
        /// Its display name.
        name: String,
    },
    /// A client finished unexpectedly and will be started again.
    RestartScheduled {
        /// The client.
        client: ClientId,
        /// Its display name.
        name: String,
        /// Time until the attempt.
        delay: Duration,
    },
    /// A client was removed from the fleet for good.
    ClientRetired {
        /// The client.
        client: ClientId,
        /// Its display name.
        name: String,
    },
    /// Every client is gone after `shutdown`. Emitted once.
    ShutdownFinished,
}

type Observer = Box<dyn FnMut(&ManagerEvent)>;

/// Owns every client of a session.
pub struct ClientManager {
    lifecycle: Lifecycle,
    clients: Vec<Client>,
    exclusive_requests: HashMap<RequestId, Vec<ClientId>>,
    restarting: HashSet<ClientId>,
    shutting_down: bool,
    shutdown_finished: bool,
    timers: TimerQueue,
    observers: Vec<Observer>,
    inbox_tx: DeliverySender,
    inbox_rx: DeliveryReceiver,
    next_exclusive: u64,
}

impl ClientManager {
    /// Creates an empty fleet.
    #[must_use]
    pub fn new(lifecycle: Lifecycle) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            lifecycle,
            clients: Vec::new(),
            exclusive_requests: HashMap::new(),
            restarting: HashSet::new(),
            shutting_down: false,
            shutdown_finished: false,
            timers: TimerQueue::default(),
            observers: Vec::new(),
            inbox_tx,
            inbox_rx,
            next_exclusive: 1,
        }
    }

    /// Registers an observer. Observers run synchronously, in registration
    /// order, from inside the manager.
    pub fn subscribe(&mut self, observer: impl FnMut(&ManagerEvent) + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn emit(&mut self, event: &ManagerEvent) {
        for observer in &mut self.observers {
            observer(event);
        }
    }

    /// Takes ownership of `client`, starts it and sends the handshake.
    ///
    /// A client whose transport cannot be started is retired at once, as is
    /// any client added after `shutdown`.
    pub fn start_client(&mut self, client: Client) -> ClientId {
        let id = client.id();
        self.clients.push(client);

        if self.shutting_down {
            warn!("Not starting {}: shutting down", id);
            self.retire(id);
        } else {
            self.launch(id);
        }
        id
    }

    fn launch(&mut self, id: ClientId) {
        let Some(client) = self.clients.iter_mut().find(|c| c.id() == id) else {
            return;
        };

        if let Err(e) = client.start(&self.inbox_tx) {
            error!("Failed to start {}: {}", client.name(), e);
            self.retire(id);
            return;
        }
        if let Err(e) = client.initialize() {
            error!("Failed to initialize {}: {}", client.name(), e);
        }
        self.drain_events(id);
    }

    /// All registered clients, in registration order.
    #[must_use]
    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    /// Looks up a registered client.
    #[must_use]
    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.iter().find(|c| c.id() == id)
    }

    /// Looks up a registered client for sending.
    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.id() == id)
    }

    /// Clients that completed the handshake and are not shutting down.
    pub fn reachable_clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter().filter(|c| c.reachable())
    }

    /// Status snapshots of every registered client.
    #[must_use]
    pub fn statuses(&self) -> Vec<ClientStatus> {
        self.clients.iter().map(Client::status).collect()
    }

    /// Sends one notification to every reachable client.
    pub fn send_to_all_reachable(&mut self, method: &str, params: &Value) {
        for client in self.clients.iter_mut().filter(|c| c.reachable()) {
            client.send_notification(method, params.clone());
        }
    }

    /// Asks every reachable client the same question; only the first answer
    /// is passed to `handler`, the other clients are told to cancel.
    ///
    /// Returns the shared request id, or `None` if no client could be asked.
    pub fn request_exclusive<F>(
        &mut self,
        method: &str,
        params: &Value,
        handler: F,
    ) -> Option<RequestId>
    where
        F: FnOnce(ClientId, ResponseResult) + 'static,
    {
        let id = RequestId::String(format!("exclusive-{}", self.next_exclusive));
        self.next_exclusive += 1;

        let slot = Rc::new(RefCell::new(Some(handler)));
        let mut asked = Vec::new();
        for client in self.clients.iter_mut().filter(|c| c.reachable()) {
            let from = client.id();
            let slot = slot.clone();
            let continuation: ResponseHandler = Box::new(move |result| {
                let handler = slot.borrow_mut().take();
                if let Some(handler) = handler {
                    handler(from, result);
                }
            });

            match client.send_request_with_id(id.clone(), method, params.clone(), continuation) {
                Ok(()) => asked.push(from),
                Err(e) => debug!("{} skipped for {}: {}", client.name(), method, e),
            }
        }

        if asked.is_empty() {
            warn!("No reachable client for {}", method);
            return None;
        }

        debug!("{} {} sent to {} client(s)", method, id, asked.len());
        for client in asked {
            self.add_exclusive_request(id.clone(), client);
        }
        Some(id)
    }

    /// Records that `client` was asked the exclusive request `id`.
    pub fn add_exclusive_request(&mut self, id: RequestId, client: ClientId) {
        let clients = self.exclusive_requests.entry(id).or_default();
        if !clients.contains(&client) {
            clients.push(client);
        }
    }

    /// Marks `id` as answered by `client`: every other client recorded for it
    /// gets a `$/cancelRequest` and the record is dropped.
    pub fn report_finished(&mut self, id: &RequestId, client: ClientId) {
        let Some(recipients) = self.exclusive_requests.remove(id) else {
            return;
        };

        for other in recipients.into_iter().filter(|c| *c != client) {
            if let Some(other) = self.client_mut(other) {
                other.cancel_request(id);
            }
        }
    }

    /// Clients still waiting on exclusive request `id`.
    #[must_use]
    pub fn exclusive_clients(&self, id: &RequestId) -> Option<&[ClientId]> {
        self.exclusive_requests.get(id).map(Vec::as_slice)
    }

    /// Whether exclusive request `id` is unanswered.
    #[must_use]
    pub fn is_exclusive_pending(&self, id: &RequestId) -> bool {
        self.exclusive_requests.contains_key(id)
    }

    fn forget_exclusive(&mut self, id: ClientId) {
        self.exclusive_requests.retain(|request, clients| {
            clients.retain(|c| *c != id);
            if clients.is_empty() {
                debug!("Dropping exclusive request {}: no client left", request);
                false
            } else {
                true
            }
        });
    }

    /// Routes one transport delivery to its client.
    pub fn handle_delivery(&mut self, delivery: Delivery) {
        let id = delivery.client;
        if self.restarting.contains(&id) {
            trace!("Dropping delivery for {}: restart pending", id);
            return;
        }
        let Some(client) = self.client_mut(id) else {
            trace!("Dropping delivery for retired client {}", id);
            return;
        };
        if delivery.session != client.session() {
            trace!(
                "Dropping delivery for {} from stale session {}",
                id, delivery.session
            );
            return;
        }

        match delivery.event {
            TransportEvent::Frame(body) => {
                if let MessageOutcome::Response(request) = client.handle_message(&body)
                    && self.exclusive_requests.contains_key(&request)
                {
                    self.report_finished(&request, id);
                }
            }
            TransportEvent::Closed(reason) => client.transport_closed(&reason),
        }
        self.drain_events(id);
    }

    /// Handles every delivery that is already queued, without waiting.
    pub fn pump(&mut self) {
        while let Ok(delivery) = self.inbox_rx.try_recv() {
            self.handle_delivery(delivery);
        }
    }

    fn drain_events(&mut self, id: ClientId) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        let name = client.name().to_string();

        for event in client.take_events() {
            match event {
                ClientEvent::Initialized => {
                    info!("{} is ready", name);
                    self.emit(&ManagerEvent::ClientInitialized {
                        client: id,
                        name: name.clone(),
                    });
                }
                ClientEvent::Finished => self.client_finished(id),
            }
        }
    }

    /// Decides between restart and retirement after `id` finished.
    ///
    /// Reports for a client that already has a restart pending are ignored.
    pub fn client_finished(&mut self, id: ClientId) {
        if self.restarting.contains(&id) {
            debug!("Ignoring finish of {}: restart already pending", id);
            return;
        }

        let shutting_down = self.shutting_down;
        let backoff = self.lifecycle.restart_backoff;
        let Some(client) = self.client_mut(id) else {
            return;
        };
        let name = client.name().to_string();
        let unexpected = !client.state().is_deliberate_shutdown();

        // Nothing the client was asked can be answered any more.
        self.forget_exclusive(id);

        if unexpected && !shutting_down {
            let Some(client) = self.client_mut(id) else {
                return;
            };
            if client.reset() {
                warn!(
                    "{} unexpectedly finished, restarting in {}s ({} restart(s) left)",
                    name,
                    backoff.as_secs_f32(),
                    client.restarts_left()
                );
                self.restarting.insert(id);
                self.timers
                    .schedule(Instant::now() + backoff, Timer::Restart(id));
                self.emit(&ManagerEvent::RestartScheduled {
                    client: id,
                    name,
                    delay: backoff,
                });
                return;
            }
            warn!("{} unexpectedly finished and is out of restarts", name);
        }

        self.retire(id);
    }

    fn retire(&mut self, id: ClientId) {
        let Some(index) = self.clients.iter().position(|c| c.id() == id) else {
            return;
        };
        let mut client = self.clients.remove(index);
        client.close();

        self.restarting.remove(&id);
        self.timers.cancel(Timer::Restart(id));
        self.forget_exclusive(id);

        info!("Retired {} ({})", client.name(), client.state());
        self.emit(&ManagerEvent::ClientRetired {
            client: id,
            name: client.name().to_string(),
        });
        self.check_shutdown_complete();
    }

    /// Begins the graceful shutdown of the fleet. Idempotent.
    ///
    /// Reachable clients are asked to shut down, the rest are retired at once.
    /// Whatever is left when the shutdown timeout expires is retired then.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            debug!("Shutdown already in progress");
            return;
        }
        self.shutting_down = true;
        info!("Shutting down {} client(s)", self.clients.len());

        self.timers.schedule(
            Instant::now() + self.lifecycle.shutdown_timeout,
            Timer::ShutdownDeadline,
        );

        let ids: Vec<ClientId> = self.clients.iter().map(Client::id).collect();
        for id in ids {
            let Some(client) = self.client_mut(id) else {
                continue;
            };
            if !client.reachable() {
                self.retire(id);
                continue;
            }
            if let Err(e) = client.shutdown() {
                warn!("Retiring {}: {}", client.name(), e);
                self.retire(id);
            }
        }

        self.check_shutdown_complete();
    }

    fn check_shutdown_complete(&mut self) {
        if self.shutting_down && self.clients.is_empty() {
            self.finish_shutdown();
        }
    }

    fn finish_shutdown(&mut self) {
        if self.shutdown_finished {
            return;
        }
        self.shutdown_finished = true;
        self.timers.cancel(Timer::ShutdownDeadline);
        info!("All clients shut down");
        self.emit(&ManagerEvent::ShutdownFinished);
    }

    fn fire(&mut self, timer: Timer) {
        match timer {
            Timer::Restart(id) => {
                self.restarting.remove(&id);
                if self.shutting_down {
                    self.retire(id);
                } else {
                    info!("Restarting {}", id);
                    self.launch(id);
                }
            }
            Timer::ShutdownDeadline => {
                if !self.clients.is_empty() {
                    warn!(
                        "Shutdown timed out, dropping {} client(s)",
                        self.clients.len()
                    );
                }
                let ids: Vec<ClientId> = self.clients.iter().map(Client::id).collect();
                for id in ids {
                    self.retire(id);
                }
                self.finish_shutdown();
            }
        }
    }

    /// Fires every timer due at `now`.
    pub fn fire_due_timers(&mut self, now: Instant) {
        while let Some(timer) = self.timers.pop_due(now) {
            self.fire(timer);
        }
    }

    /// Earliest pending timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Waits for the next delivery or timer and handles it.
    pub async fn process_next(&mut self) {
        let deadline = self.timers.next_deadline();
        let timer = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            delivery = self.inbox_rx.recv() => {
                if let Some(delivery) = delivery {
                    self.handle_delivery(delivery);
                }
            }
            () = timer => self.fire_due_timers(Instant::now()),
        }
    }

    /// Processes events until `done` holds.
    pub async fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) {
        while !done(self) {
            self.process_next().await;
        }
    }

    /// Whether `shutdown` was called.
    #[must_use]
    pub const fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Whether the shutdown sequence completed.
    #[must_use]
    pub const fn is_shutdown_finished(&self) -> bool {
        self.shutdown_finished
    }

    /// Whether `id` is waiting for its restart timer.
    #[must_use]
    pub fn is_restart_pending(&self, id: ClientId) -> bool {
        self.restarting.contains(&id)
    }

    /// Whether every remaining client is ready and no restart is pending.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.restarting.is_empty() && self.clients.iter().all(Client::reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::client::ClientSettings;
    use crate::lsp::state::ClientState;
    use crate::lsp::testing::FakeBackend;
    use crate::lsp::transport::CloseReason;
    use anyhow::{Context, Result};
    use serde_json::json;
    use std::path::PathBuf;

    fn settings() -> ClientSettings {
        ClientSettings::new(PathBuf::from("/tmp/project"))
    }

    fn record(manager: &mut ClientManager) -> Rc<RefCell<Vec<ManagerEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        manager.subscribe(move |event| sink.borrow_mut().push(event.clone()));
        events
    }

    /// A manager whose clients all completed the handshake.
    fn ready_fleet(backends: &[FakeBackend]) -> (ClientManager, Vec<ClientId>) {
        let mut manager = ClientManager::new(Lifecycle::default());
        let ids = backends
            .iter()
            .enumerate()
            .map(|(i, backend)| manager.start_client(backend.client(&format!("ls{i}"), settings())))
            .collect();
        for backend in backends {
            backend.accept_initialize();
        }
        manager.pump();
        (manager, ids)
    }

    fn fleet_of(n: usize) -> Vec<FakeBackend> {
        (0..n).map(|_| FakeBackend::default()).collect()
    }

    #[test]
    fn test_start_client_runs_handshake() {
        let backend = FakeBackend::default();
        let mut manager = ClientManager::new(Lifecycle::default());
        let events = record(&mut manager);

        let id = manager.start_client(backend.client("ls", settings()));
        assert_eq!(backend.starts(), 1);
        assert_eq!(backend.sent_methods(), vec!["initialize"]);
        assert_eq!(manager.reachable_clients().count(), 0);

        backend.accept_initialize();
        manager.pump();

        assert_eq!(manager.reachable_clients().count(), 1);
        assert_eq!(
            *events.borrow(),
            vec![ManagerEvent::ClientInitialized {
                client: id,
                name: "ls".to_string()
            }]
        );
    }

    #[test]
    fn test_start_failure_retires_without_restart() {
        let backend = FakeBackend::refusing();
        let mut manager = ClientManager::new(Lifecycle::default());
        let events = record(&mut manager);

        let id = manager.start_client(backend.client("broken", settings()));

        assert!(manager.clients().is_empty());
        assert!(!manager.is_restart_pending(id));
        assert!(manager.next_deadline().is_none());
        assert_eq!(
            *events.borrow(),
            vec![ManagerEvent::ClientRetired {
                client: id,
                name: "broken".to_string()
            }]
        );
    }

    #[test]
    fn test_reachable_excludes_initializing_clients() {
        let backends = fleet_of(2);
        let (mut manager, _) = ready_fleet(&backends);
        let late = FakeBackend::default();
        manager.start_client(late.client("late", settings()));

        let names: Vec<&str> = manager.reachable_clients().map(Client::name).collect();
        assert_eq!(names, vec!["ls0", "ls1"]);

        manager.send_to_all_reachable("workspace/didChangeConfiguration", &json!({}));
        for backend in &backends {
            assert!(
                backend
                    .sent_methods()
                    .contains(&"workspace/didChangeConfiguration".to_string())
            );
        }
        assert_eq!(late.sent_methods(), vec!["initialize"]);
    }

    #[test]
    fn test_exclusive_request_first_answer_wins() -> Result<()> {
        let backends = fleet_of(3);
        let (mut manager, ids) = ready_fleet(&backends);
        let answers = Rc::new(RefCell::new(Vec::new()));
        let sink = answers.clone();

        let id = manager
            .request_exclusive("textDocument/definition", &json!({}), move |from, result| {
                sink.borrow_mut().push((from, result));
            })
            .context("no client asked")?;
        assert_eq!(manager.exclusive_clients(&id), Some(&ids[..]));

        backends[1].respond(&id, json!({ "uri": "file:///a.c" }));
        manager.pump();

        assert_eq!(
            *answers.borrow(),
            vec![(ids[1], Ok(json!({ "uri": "file:///a.c" })))]
        );
        assert!(!manager.is_exclusive_pending(&id));
        assert_eq!(backends[0].cancelled(), vec![id.clone()]);
        assert_eq!(backends[2].cancelled(), vec![id.clone()]);
        assert!(backends[1].cancelled().is_empty());

        // A late answer from a cancelled client is dropped.
        backends[2].respond(&id, json!(null));
        manager.pump();
        assert_eq!(answers.borrow().len(), 1);
        assert_eq!(manager.reachable_clients().count(), 3);
        Ok(())
    }

    #[test]
    fn test_report_finished_cancels_every_other_client_once() {
        let backends = fleet_of(3);
        let (mut manager, ids) = ready_fleet(&backends);
        let id = RequestId::String("shared".to_string());
        for client in &ids {
            manager.add_exclusive_request(id.clone(), *client);
        }
        manager.add_exclusive_request(id.clone(), ids[0]);

        manager.report_finished(&id, ids[0]);
        manager.report_finished(&id, ids[0]);

        assert!(!manager.is_exclusive_pending(&id));
        assert!(backends[0].cancelled().is_empty());
        assert_eq!(backends[1].cancelled(), vec![id.clone()]);
        assert_eq!(backends[2].cancelled(), vec![id]);
    }

    #[test]
    fn test_exclusive_request_without_reachable_clients() {
        let mut manager = ClientManager::new(Lifecycle::default());
        let id = manager.request_exclusive("workspace/symbol", &json!({}), |_, _| {});
        assert!(id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_finish_restarts_after_backoff() -> Result<()> {
        let backend = FakeBackend::default();
        let (mut manager, ids) = ready_fleet(std::slice::from_ref(&backend));
        let events = record(&mut manager);
        let id = ids[0];

        backend.crash();
        manager.pump();
        assert!(manager.is_restart_pending(id));
        let client = manager.client(id).context("client retired")?;
        assert_eq!(client.state(), ClientState::Uninitialized);
        assert_eq!(client.restarts_left(), 4);

        // A second report while waiting does not schedule another attempt.
        manager.client_finished(id);

        tokio::time::advance(Duration::from_millis(4_900)).await;
        manager.fire_due_timers(Instant::now());
        assert_eq!(backend.starts(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        manager.fire_due_timers(Instant::now());
        assert_eq!(backend.starts(), 2);
        assert!(!manager.is_restart_pending(id));

        backend.accept_initialize();
        manager.pump();
        assert_eq!(manager.reachable_clients().count(), 1);

        let restarts = events
            .borrow()
            .iter()
            .filter(|e| matches!(e, ManagerEvent::RestartScheduled { .. }))
            .count();
        assert_eq!(restarts, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_waits_for_backoff() {
        let backend = FakeBackend::default();
        let (mut manager, _) = ready_fleet(std::slice::from_ref(&backend));
        let started = Instant::now();

        backend.crash();
        manager.run_until(|_| backend.starts() == 2).await;

        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_exhausted_budget_retires() {
        let backend = FakeBackend::default();
        let mut manager = ClientManager::new(Lifecycle::default());
        let id = manager.start_client(backend.client(
            "fragile",
            ClientSettings {
                restart_budget: 0,
                ..settings()
            },
        ));
        backend.accept_initialize();
        manager.pump();
        let events = record(&mut manager);

        backend.crash();
        manager.pump();

        assert!(manager.clients().is_empty());
        assert!(!manager.is_restart_pending(id));
        assert_eq!(
            *events.borrow(),
            vec![ManagerEvent::ClientRetired {
                client: id,
                name: "fragile".to_string()
            }]
        );
    }

    #[test]
    fn test_graceful_shutdown() -> Result<()> {
        let backend = FakeBackend::default();
        let (mut manager, ids) = ready_fleet(std::slice::from_ref(&backend));
        let events = record(&mut manager);

        manager.shutdown();
        let client = manager.client(ids[0]).context("client retired early")?;
        assert_eq!(client.state(), ClientState::ShutdownRequested);
        assert!(!client.reachable());

        let id = backend.request_ids("shutdown").pop().context("no shutdown sent")?;
        backend.respond(&id, Value::Null);
        manager.pump();

        assert!(manager.clients().is_empty());
        assert_eq!(backend.sent_methods().last().map(String::as_str), Some("exit"));
        assert_eq!(
            *events.borrow(),
            vec![
                ManagerEvent::ClientRetired {
                    client: ids[0],
                    name: "ls0".to_string()
                },
                ManagerEvent::ShutdownFinished,
            ]
        );
        assert!(manager.next_deadline().is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_bounded() -> Result<()> {
        let backends = fleet_of(2);
        let (mut manager, _) = ready_fleet(&backends);
        let events = record(&mut manager);

        manager.shutdown();
        manager.shutdown();
        assert_eq!(backends[0].request_ids("shutdown").len(), 1);
        assert_eq!(backends[1].request_ids("shutdown").len(), 1);

        // Only the first backend acknowledges; the second hangs.
        let id = backends[0].request_ids("shutdown").pop().context("no shutdown")?;
        backends[0].respond(&id, Value::Null);
        manager.pump();
        assert_eq!(manager.clients().len(), 1);
        assert!(!manager.is_shutdown_finished());

        let started = Instant::now();
        manager.run_until(ClientManager::is_shutdown_finished).await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(manager.clients().is_empty());

        tokio::time::advance(Duration::from_secs(10)).await;
        manager.fire_due_timers(Instant::now());

        let finished = events
            .borrow()
            .iter()
            .filter(|e| **e == ManagerEvent::ShutdownFinished)
            .count();
        assert_eq!(finished, 1);
        Ok(())
    }

    #[test]
    fn test_shutdown_retires_unreachable_clients_at_once() {
        let backend = FakeBackend::default();
        let mut manager = ClientManager::new(Lifecycle::default());
        let events = record(&mut manager);
        manager.start_client(backend.client("slow", settings()));

        manager.shutdown();

        assert!(manager.clients().is_empty());
        assert!(manager.is_shutdown_finished());
        assert!(!backend.sent_methods().contains(&"shutdown".to_string()));
        assert_eq!(events.borrow().last(), Some(&ManagerEvent::ShutdownFinished));
    }

    #[test]
    fn test_no_restart_while_shutting_down() {
        let backends = fleet_of(1);
        let (mut manager, ids) = ready_fleet(&backends);

        manager.shutdown();
        backends[0].crash();
        manager.pump();

        assert!(!manager.is_restart_pending(ids[0]));
        assert!(manager.is_shutdown_finished());
        assert_eq!(backends[0].starts(), 1);
    }

    #[test]
    fn test_start_during_shutdown_is_refused() {
        let mut manager = ClientManager::new(Lifecycle::default());
        manager.shutdown();

        let backend = FakeBackend::default();
        manager.start_client(backend.client("late", settings()));

        assert_eq!(backend.starts(), 0);
        assert!(manager.clients().is_empty());
    }

    #[test]
    fn test_retired_clients_leave_exclusive_requests() -> Result<()> {
        let backends = fleet_of(2);
        let mut manager = ClientManager::new(Lifecycle::default());
        let ids: Vec<ClientId> = backends
            .iter()
            .map(|b| {
                manager.start_client(b.client(
                    "once",
                    ClientSettings {
                        restart_budget: 0,
                        ..settings()
                    },
                ))
            })
            .collect();
        for backend in &backends {
            backend.accept_initialize();
        }
        manager.pump();

        let id = manager
            .request_exclusive("workspace/symbol", &json!({}), |_, _| {})
            .context("no client asked")?;

        backends[0].crash();
        manager.pump();
        assert_eq!(manager.exclusive_clients(&id), Some(&ids[1..]));

        backends[1].crash();
        manager.pump();
        assert!(!manager.is_exclusive_pending(&id));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_is_ignored() -> Result<()> {
        let backend = FakeBackend::default();
        let (mut manager, ids) = ready_fleet(std::slice::from_ref(&backend));
        let id = ids[0];

        backend.crash();
        manager.pump();
        tokio::time::advance(Duration::from_secs(5)).await;
        manager.fire_due_timers(Instant::now());
        backend.accept_initialize();
        manager.pump();

        let stale = Delivery {
            client: id,
            session: 1,
            event: TransportEvent::Closed(CloseReason::EndOfStream),
        };
        manager.handle_delivery(stale);

        let client = manager.client(id).context("client retired")?;
        assert_eq!(client.session(), 2);
        assert!(client.reachable());
        Ok(())
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let mut manager = ClientManager::new(Lifecycle::default());
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            manager.subscribe(move |_| order.borrow_mut().push(tag));
        }

        manager.shutdown();

        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }
}
