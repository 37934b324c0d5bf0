//! Active-message transport abstraction.
//!
//! A transport delivers opaque byte batches to handlers that were registered
//! under small integer indices. Handlers run on whichever thread calls
//! [`Transport::progress`] in the receiving process, and may answer the
//! message they are handling through its token.

pub mod mesh;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

pub use mesh::{MESH_PROGRESS_BUDGET, MeshNode, MeshToken, create_mesh};

/// Index of a registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerIndex(pub u8);

/// First handler index used by amrpc. Lower indices stay free for the
/// transport itself.
pub const HANDLER_INDEX_BASE: u8 = 128;

bitflags! {
    /// Message classes a handler accepts.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HandlerFlags: u8 {
        /// Invoked for [`Transport::request`] messages.
        const REQUEST = 1 << 0;
        /// Invoked for [`Transport::reply`] messages.
        const REPLY = 1 << 1;
        /// Payload is a medium-sized byte buffer copied by the transport.
        const MEDIUM = 1 << 2;
    }
}

/// A handler body: transport, token of the message being handled, payload.
pub type HandlerFn<T> = Arc<dyn Fn(&T, &<T as Transport>::Token, &[u8]) + Send + Sync>;

/// One row of a transport's handler table.
pub struct HandlerEntry<T: Transport> {
    pub index: HandlerIndex,
    pub handler: HandlerFn<T>,
    pub flags: HandlerFlags,
}

impl<T: Transport> HandlerEntry<T> {
    pub fn new(index: HandlerIndex, flags: HandlerFlags, handler: HandlerFn<T>) -> Self {
        Self {
            index,
            handler,
            flags,
        }
    }
}

impl<T: Transport> Clone for HandlerEntry<T> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            handler: Arc::clone(&self.handler),
            flags: self.flags,
        }
    }
}

impl<T: Transport> fmt::Debug for HandlerEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("index", &self.index)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Error returned by transport operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Destination rank does not exist.
    InvalidPeer(usize),
    /// Destination rank has shut down.
    Disconnected(usize),
    /// Handlers were already registered on this endpoint.
    AlreadyRegistered,
    /// Two entries share one handler index.
    DuplicateHandler(u8),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidPeer(rank) => write!(f, "invalid peer rank {}", rank),
            TransportError::Disconnected(rank) => write!(f, "peer {} has disconnected", rank),
            TransportError::AlreadyRegistered => write!(f, "handlers already registered"),
            TransportError::DuplicateHandler(index) => {
                write!(f, "handler index {} registered twice", index)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// An active-message endpoint of one process.
///
/// # Safety
/// A handler must only ever be given payloads that were passed to
/// [`request`](Self::request) or [`reply`](Self::reply) by a peer running
/// the same program, byte for byte. Request batches carry call encodings
/// that are executed without validation.
pub unsafe trait Transport: Send + Sync + Sized + 'static {
    /// Identifies the message being handled, for replies.
    type Token;

    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of processes.
    fn nprocs(&self) -> usize;

    /// Installs the handler table. Allowed once per endpoint.
    fn register(&self, entries: Vec<HandlerEntry<Self>>) -> Result<(), TransportError>;

    /// Sends `payload` to the `handler` of process `dest`.
    fn request(
        &self,
        dest: usize,
        handler: HandlerIndex,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Answers the message identified by `token`.
    fn reply(
        &self,
        token: &Self::Token,
        handler: HandlerIndex,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Runs pending handlers on the calling thread. Returns how many ran.
    fn progress(&self) -> usize;
}
