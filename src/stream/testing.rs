//! Scripted in-memory relay for tests
//!
//! Each `accept`/`refuse`/`hang` queues the outcome of the next dial for a
//! transport kind. Accepted dials hand back a [`RelayHandle`] used to push
//! frames, inject errors, or close the channel (by dropping the handle).

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::session::types::Identity;
use crate::stream::transport::{RawFrame, Transport, TransportFactory, TransportKind};

type Delivery = Result<Vec<RawFrame>>;

enum Dial {
    Accept(ScriptedTransport),
    Refuse(String),
    Misconfigure(String),
    Hang,
}

#[derive(Default)]
struct Script {
    dials: HashMap<TransportKind, VecDeque<Dial>>,
    attempts: Vec<TransportKind>,
    identities: Vec<Identity>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedRelay {
    script: Arc<Mutex<Script>>,
}

pub(crate) struct RelayHandle {
    tx: mpsc::UnboundedSender<Delivery>,
    closed: Arc<AtomicBool>,
}

struct ScriptedTransport {
    kind: TransportKind,
    rx: mpsc::UnboundedReceiver<Delivery>,
    /// Frames returned with the handshake, like a polling relay does
    buffered: Vec<RawFrame>,
    closed: Arc<AtomicBool>,
}

impl ScriptedRelay {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(self.clone())
    }

    pub(crate) fn accept(&self, kind: TransportKind) -> RelayHandle {
        self.accept_buffered(kind, Vec::new())
    }

    /// Accept a dial whose handshake already carried `buffered` frames
    pub(crate) fn accept_buffered(&self, kind: TransportKind, buffered: Vec<RawFrame>) -> RelayHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.push_dial(
            kind,
            Dial::Accept(ScriptedTransport {
                kind,
                rx,
                buffered,
                closed: Arc::clone(&closed),
            }),
        );
        RelayHandle { tx, closed }
    }

    pub(crate) fn refuse(&self, kind: TransportKind, reason: &str) {
        self.push_dial(kind, Dial::Refuse(reason.to_string()));
    }

    /// Fail the next dial with a configuration error
    pub(crate) fn misconfigure(&self, kind: TransportKind, reason: &str) {
        self.push_dial(kind, Dial::Misconfigure(reason.to_string()));
    }

    pub(crate) fn hang(&self, kind: TransportKind) {
        self.push_dial(kind, Dial::Hang);
    }

    /// Every dial attempted so far, in order
    pub(crate) fn attempts(&self) -> Vec<TransportKind> {
        self.script.lock().unwrap().attempts.clone()
    }

    pub(crate) fn identities(&self) -> Vec<Identity> {
        self.script.lock().unwrap().identities.clone()
    }

    fn push_dial(&self, kind: TransportKind, dial: Dial) {
        self.script
            .lock()
            .unwrap()
            .dials
            .entry(kind)
            .or_default()
            .push_back(dial);
    }
}

#[async_trait]
impl TransportFactory for ScriptedRelay {
    async fn connect(&self, kind: TransportKind, identity: &Identity) -> Result<Box<dyn Transport>> {
        let dial = {
            let mut script = self.script.lock().unwrap();
            script.attempts.push(kind);
            script.identities.push(identity.clone());
            script.dials.get_mut(&kind).and_then(|q| q.pop_front())
        };

        match dial {
            Some(Dial::Accept(transport)) => Ok(Box::new(transport)),
            Some(Dial::Refuse(reason)) => Err(Error::Transport(reason)),
            Some(Dial::Misconfigure(reason)) => Err(Error::Config(reason)),
            Some(Dial::Hang) => std::future::pending().await,
            None => Err(Error::Transport(format!("no scripted {} dial", kind))),
        }
    }
}

impl RelayHandle {
    pub(crate) fn push(&self, frame: RawFrame) {
        let _ = self.tx.send(Ok(vec![frame]));
    }

    pub(crate) fn push_batch(&self, frames: Vec<RawFrame>) {
        let _ = self.tx.send(Ok(frames));
    }

    pub(crate) fn fail(&self, reason: &str) {
        let _ = self.tx.send(Err(Error::Transport(reason.to_string())));
    }

    /// Whether the client closed its end
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn recv(&mut self) -> Result<Option<Vec<RawFrame>>> {
        if !self.buffered.is_empty() {
            return Ok(Some(std::mem::take(&mut self.buffered)));
        }
        match self.rx.recv().await {
            Some(delivery) => delivery.map(Some),
            None => Ok(None),
        }
    }

    fn take_buffered(&mut self) -> Vec<RawFrame> {
        std::mem::take(&mut self.buffered)
    }

    async fn close(&mut self) {
        self.buffered.clear();
        self.closed.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}
