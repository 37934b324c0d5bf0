//! amrpc - Active-message RPC core with batched handlers and completion futures.
//!
//! # Architecture
//!
//! ```text
//!   issuing process P                           destination process Q
//! ┌──────────────────────────────┐          ┌──────────────────────────────┐
//! │ Context::rpc(worker, f, a)   │          │                              │
//! │   │ reserve SlotId           │          │                              │
//! │   ▼                          │ request  │  request handler             │
//! │ Dispatcher ──[CallEnvelope]*─┼─────────►│   for each envelope:         │
//! │   requested += n             │          │     enter(target_worker)     │
//! │                              │          │     call.execute()           │
//! │                              │  reply   │   one reply per batch        │
//! │ ack handler ◄─[ResultEnv.]*──┼──────────┤                              │
//! │   write payload, set ready   │          │                              │
//! │   acknowledged += n          │          │                              │
//! │                              │          │                              │
//! │ Future::wait / Context::flush│          │                              │
//! │   spin on a progress Driver  │          │                              │
//! └──────────────────────────────┘          └──────────────────────────────┘
//! ```
//!
//! - **Batches**: a flat concatenation of fixed-size records, no header. The
//!   receiver recovers the count from the byte length.
//! - **Completion slots**: results are routed back by [`SlotId`], an index
//!   into the issuing process's [`CompletionTable`]. No address crosses the
//!   transport.
//! - **Quiescence**: [`Context::flush`] returns once `acknowledged` has caught
//!   up with `requested`.
//! - **Payloads**: arguments and results are [`Serial`], i.e. `zerocopy`
//!   `IntoBytes` values with no padding. Pass several arguments as an array
//!   or a `#[derive(IntoBytes, Immutable)]` struct.
//!
//! # Example
//!
//! ```
//! use amrpc::{Context, ContextConfig, create_mesh};
//!
//! fn square(x: u64) -> u64 {
//!     x * x
//! }
//!
//! let node = create_mesh(1).pop().unwrap();
//! let ctx: Context<_> = Context::new(node, ContextConfig::default()).unwrap();
//! let fut = ctx.rpc(0, square, 12).unwrap();
//! assert_eq!(fut.wait(), 144);
//! ctx.flush().unwrap();
//! assert_eq!(ctx.requested(), ctx.acknowledged());
//! ```

pub mod ambient;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod future;
pub mod handler;
pub mod pack;
pub mod progress;
pub mod serial;
pub mod transport;

pub use config::{ContextConfig, ProgressMode, WaitStrategy};
pub use context::Context;
pub use encoding::{
    ARGS_CAPACITY, EncodedCall, FnCall, RESULT_CAPACITY, ResultBuf, decode_value, encode_value,
};
pub use envelope::{CallEnvelope, ResultEnvelope, SlotId};
pub use error::{Error, Result};
pub use flow::FlowControl;
pub use future::{CompletionTable, Future, FutureStatus};
pub use handler::{ACK_HANDLER, REQUEST_HANDLER};
pub use pack::{BufferPack, BufferPackMut, pack_records};
pub use progress::{Driver, ProgressPump};
pub use serial::Serial;
pub use zerocopy;
pub use transport::{
    HANDLER_INDEX_BASE, HandlerEntry, HandlerFlags, HandlerFn, HandlerIndex, MeshNode, MeshToken,
    Transport, TransportError, create_mesh,
};
