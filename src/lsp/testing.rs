// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! In-memory backend for unit tests.
//!
//! [`FakeBackend`] records every frame a client sends and lets the test push
//! responses, notifications and stream closure through the real delivery
//! channel.

use bytes::{Bytes, BytesMut};
use serde_json::{Value, json};
use std::cell::RefCell;
use std::rc::Rc;

use super::client::{Client, ClientSettings};
use super::error::TransportError;
use super::protocol::{self, NotificationMessage, RequestId, ResponseMessage};
use super::transport::{CloseReason, DeliveryReceiver, Inbox, Transport, TransportEvent};

#[derive(Default)]
struct Wire {
    sent: Vec<Value>,
    inbox: Option<Inbox>,
    open: bool,
    starts: usize,
    refuse_start: bool,
}

/// Shared handle to a scripted backend.
#[derive(Clone, Default)]
pub struct FakeBackend(Rc<RefCell<Wire>>);

struct FakeTransport(FakeBackend);

impl Transport for FakeTransport {
    fn start(&mut self, inbox: Inbox) -> Result<(), TransportError> {
        let mut wire = self.0.0.borrow_mut();
        if wire.refuse_start {
            return Err(TransportError::Spawn {
                program: "fake".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such backend"),
            });
        }
        wire.starts += 1;
        wire.open = true;
        wire.inbox = Some(inbox);
        Ok(())
    }

    fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let mut wire = self.0.0.borrow_mut();
        if !wire.open {
            return Err(TransportError::Closed);
        }
        let mut buffer = BytesMut::from(&frame[..]);
        if let Ok(Some(body)) = protocol::try_parse_message(&mut buffer)
            && let Ok(value) = serde_json::from_slice(&body)
        {
            wire.sent.push(value);
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.0.0.borrow().open
    }

    fn close(&mut self) {
        self.0.0.borrow_mut().open = false;
    }

    fn describe(&self) -> String {
        "fake backend".to_string()
    }
}

impl FakeBackend {
    /// A backend whose transport refuses to start.
    pub fn refusing() -> Self {
        let backend = Self::default();
        backend.0.borrow_mut().refuse_start = true;
        backend
    }

    /// A client wired to this backend.
    pub fn client(&self, name: &str, settings: ClientSettings) -> Client {
        Client::new(name, Box::new(FakeTransport(self.clone())), settings)
    }

    /// How many times the transport was started.
    pub fn starts(&self) -> usize {
        self.0.borrow().starts
    }

    /// Whether the transport is currently open.
    pub fn is_open(&self) -> bool {
        self.0.borrow().open
    }

    /// Every decoded frame the client sent, oldest first.
    pub fn sent(&self) -> Vec<Value> {
        self.0.borrow().sent.clone()
    }

    /// Method names of sent frames, oldest first.
    pub fn sent_methods(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Ids of sent requests with the given method.
    pub fn request_ids(&self, method: &str) -> Vec<RequestId> {
        self.sent()
            .iter()
            .filter(|m| m.get("method").and_then(Value::as_str) == Some(method))
            .filter_map(|m| m.get("id").cloned())
            .filter_map(|id| serde_json::from_value(id).ok())
            .collect()
    }

    /// Ids named by `$/cancelRequest` notifications.
    pub fn cancelled(&self) -> Vec<RequestId> {
        self.sent()
            .iter()
            .filter(|m| m.get("method").and_then(Value::as_str) == Some("$/cancelRequest"))
            .filter_map(|m| m.pointer("/params/id").cloned())
            .filter_map(|id| serde_json::from_value(id).ok())
            .collect()
    }

    /// Responses the client sent to server requests.
    pub fn replies(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m.get("method").is_none())
            .collect()
    }

    fn deliver(&self, event: TransportEvent) {
        let wire = self.0.borrow();
        if let Some(inbox) = &wire.inbox {
            match event {
                TransportEvent::Frame(body) => inbox.frame(body),
                TransportEvent::Closed(reason) => inbox.closed(reason),
            };
        }
    }

    /// Pushes a raw frame body.
    pub fn push_raw(&self, body: &[u8]) {
        self.deliver(TransportEvent::Frame(Bytes::copy_from_slice(body)));
    }

    fn push_json<T: serde::Serialize>(&self, message: &T) {
        if let Ok(body) = serde_json::to_vec(message) {
            self.push_raw(&body);
        }
    }

    /// Answers a request successfully.
    pub fn respond(&self, id: &RequestId, result: Value) {
        self.push_json(&ResponseMessage::success(id.clone(), result));
    }

    /// Answers a request with an error.
    pub fn respond_error(&self, id: &RequestId, code: i64, message: &str) {
        self.push_json(&ResponseMessage::failure(
            id.clone(),
            code,
            message.to_string(),
        ));
    }

    /// Answers the most recent `initialize` with a small capability set.
    pub fn accept_initialize(&self) {
        if let Some(id) = self.request_ids("initialize").last() {
            self.respond(id, initialize_result());
        }
    }

    /// Sends a notification to the client.
    pub fn notify(&self, method: &str, params: Value) {
        self.push_json(&NotificationMessage::new(method, params));
    }

    /// Sends a request to the client.
    pub fn request(&self, id: i64, method: &str, params: Value) {
        self.push_json(&protocol::RequestMessage::new(
            RequestId::Number(id),
            method,
            params,
        ));
    }

    /// Simulates the backend process dying.
    pub fn crash(&self) {
        self.deliver(TransportEvent::Closed(CloseReason::EndOfStream));
        self.0.borrow_mut().open = false;
    }
}

/// A minimal successful `initialize` result.
pub fn initialize_result() -> Value {
    json!({
        "capabilities": {
            "hoverProvider": true,
            "definitionProvider": true,
            "positionEncoding": "utf-8"
        },
        "serverInfo": { "name": "fake-ls", "version": "0.1" }
    })
}

/// Feeds every queued delivery straight into `client`, bypassing a manager.
pub fn pump(client: &mut Client, rx: &mut DeliveryReceiver) {
    while let Ok(delivery) = rx.try_recv() {
        if delivery.session != client.session() {
            continue;
        }
        match delivery.event {
            TransportEvent::Frame(body) => {
                client.handle_message(&body);
            }
            TransportEvent::Closed(reason) => client.transport_closed(&reason),
        }
    }
}
