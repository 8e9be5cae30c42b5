//! Reply routing
//!
//! The broker tags every inbound request with the identity of the connection
//! it came from. Workers hand the identity back untouched with their reply,
//! and the router uses this table to find the connection to deliver it to.

use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::ProtocolMessage;

/// Opaque identity the broker assigns to each client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request forwarded from a client connection to the worker pool
#[derive(Debug)]
pub struct Job {
    pub identity: ConnectionId,
    pub message_id: Uuid,
    pub payload: Vec<u8>,
}

/// A worker's answer to a [`Job`], still addressed by connection identity
#[derive(Debug)]
pub struct WorkerReply {
    pub identity: ConnectionId,
    pub reply_to: Uuid,
    pub payload: Vec<u8>,
}

/// Connection lifecycle notifications sent to the router
#[derive(Debug)]
pub enum RouteControl {
    Register {
        identity: ConnectionId,
        outbound: mpsc::UnboundedSender<ProtocolMessage>,
    },
    Deregister {
        identity: ConnectionId,
    },
}

/// Identity -> outbound queue of the connection's writer
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<ConnectionId, mpsc::UnboundedSender<ProtocolMessage>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, control: RouteControl) {
        match control {
            RouteControl::Register { identity, outbound } => {
                self.routes.insert(identity, outbound);
            }
            RouteControl::Deregister { identity } => {
                self.routes.remove(&identity);
            }
        }
    }

    /// Deliver a reply to the connection it belongs to. Returns `false` when
    /// that connection is gone and the reply was dropped.
    pub fn route(&mut self, reply: WorkerReply) -> bool {
        let Some(outbound) = self.routes.get(&reply.identity) else {
            debug!("Dropping reply for closed connection {}", reply.identity);
            return false;
        };

        let message = ProtocolMessage::reply(reply.reply_to, reply.payload);
        if outbound.send(message).is_err() {
            debug!("Writer for connection {} has stopped", reply.identity);
            self.routes.remove(&reply.identity);
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Run the routing loop until both the control and reply channels close.
///
/// Control messages are always drained first: a connection registers before
/// its first job is queued, so its registration is seen before any reply.
pub async fn run_router(
    mut control: mpsc::UnboundedReceiver<RouteControl>,
    mut replies: mpsc::UnboundedReceiver<WorkerReply>,
) {
    let mut table = RoutingTable::new();
    let mut control_open = true;
    let mut replies_open = true;

    while control_open || replies_open {
        tokio::select! {
            biased;
            event = control.recv(), if control_open => match event {
                Some(event) => table.apply(event),
                None => control_open = false,
            },
            reply = replies.recv(), if replies_open => match reply {
                Some(reply) => {
                    table.route(reply);
                }
                None => replies_open = false,
            },
        }
    }
    info!("🔀 Router stopped");
}
