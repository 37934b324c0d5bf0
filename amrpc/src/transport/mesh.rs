//! In-process mesh transport.
//!
//! Simulates `n` processes inside one address space. Every node owns one
//! multi-consumer inbox and holds a sender to every inbox, its own included,
//! so a process may send to itself.
//!
//! ```text
//!   node 0 ──┐
//!   node 1 ──┼──► inbox[k] ──► progress() on any thread of node k
//!   node k ──┘                    └─► handler(node, token, payload)
//! ```

use std::sync::OnceLock;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use super::{HandlerEntry, HandlerFlags, HandlerIndex, Transport, TransportError};

/// Messages handled per [`MeshNode::progress`] call at most.
pub const MESH_PROGRESS_BUDGET: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageKind {
    Request,
    Reply,
}

struct Message {
    from: usize,
    kind: MessageKind,
    handler: HandlerIndex,
    payload: Vec<u8>,
}

/// Token of a message being handled: who sent it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshToken {
    pub from: usize,
}

/// One simulated process.
pub struct MeshNode {
    rank: usize,
    inbox: Receiver<Message>,
    peers: Vec<Sender<Message>>,
    handlers: OnceLock<Vec<HandlerEntry<MeshNode>>>,
}

/// Creates a mesh of `n` nodes.
///
/// # Panics
/// Panics if `n` is 0.
pub fn create_mesh(n: usize) -> Vec<MeshNode> {
    assert!(n > 0, "must have at least one node");

    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..n).map(|_| crossbeam_channel::unbounded()).unzip();

    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| MeshNode {
            rank,
            inbox,
            peers: senders.clone(),
            handlers: OnceLock::new(),
        })
        .collect()
}

impl MeshNode {
    fn send(&self, dest: usize, msg: Message) -> Result<(), TransportError> {
        let tx = self.peers.get(dest).ok_or(TransportError::InvalidPeer(dest))?;
        tx.send(msg).map_err(|_| TransportError::Disconnected(dest))
    }

    /// Number of messages waiting in this node's inbox.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    fn dispatch(&self, handlers: &[HandlerEntry<MeshNode>], msg: Message) {
        let entry = match handlers.iter().find(|e| e.index == msg.handler) {
            Some(entry) => entry,
            None => panic!(
                "node {}: message from {} for unregistered handler {}",
                self.rank, msg.from, msg.handler.0
            ),
        };
        let required = match msg.kind {
            MessageKind::Request => HandlerFlags::REQUEST,
            MessageKind::Reply => HandlerFlags::REPLY,
        };
        assert!(
            entry.flags.contains(required),
            "node {}: {:?} delivered to handler {} with flags {:?}",
            self.rank,
            msg.kind,
            msg.handler.0,
            entry.flags
        );
        (entry.handler)(self, &MeshToken { from: msg.from }, msg.payload.as_slice());
    }
}

// SAFETY: payloads move through the channels unchanged, and only nodes of
// one mesh, inside one program, hold senders to each other's inboxes.
unsafe impl Transport for MeshNode {
    type Token = MeshToken;

    fn rank(&self) -> usize {
        self.rank
    }

    fn nprocs(&self) -> usize {
        self.peers.len()
    }

    fn register(&self, entries: Vec<HandlerEntry<Self>>) -> Result<(), TransportError> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.index == entry.index) {
                return Err(TransportError::DuplicateHandler(entry.index.0));
            }
        }
        self.handlers
            .set(entries)
            .map_err(|_| TransportError::AlreadyRegistered)
    }

    fn request(
        &self,
        dest: usize,
        handler: HandlerIndex,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.send(
            dest,
            Message {
                from: self.rank,
                kind: MessageKind::Request,
                handler,
                payload,
            },
        )
    }

    fn reply(
        &self,
        token: &MeshToken,
        handler: HandlerIndex,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.send(
            token.from,
            Message {
                from: self.rank,
                kind: MessageKind::Reply,
                handler,
                payload,
            },
        )
    }

    fn progress(&self) -> usize {
        let Some(handlers) = self.handlers.get() else {
            return 0;
        };
        let mut handled = 0;
        while handled < MESH_PROGRESS_BUDGET {
            match self.inbox.try_recv() {
                Ok(msg) => {
                    self.dispatch(handlers, msg);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }
}
