//! # keyflow
//!
//! A runtime for keyed, stateful stream processing on a cluster of nodes.
//!
//! Events carry a key. The key picks a partition, the partition picks the
//! node that owns it, and on that node the key picks one processing element
//! (PE) instance that holds the state for it. Each instance sees its events
//! one at a time, and its state can be checkpointed in the background without
//! ever observing a half-applied event.
//!
//! ## Key Features
//!
//! - **Deterministic partitioning**: the same key maps to the same partition on every node
//! - **Length-prefixed TCP transport**: one pooled connection per destination, bounded inbound queue
//! - **Key-affine dispatch**: a fixed pool of workers, each key always handled by the same worker
//! - **Lazy PE instances**: created on first event, restored from the last checkpoint if one exists
//! - **Consistent checkpoints**: a coordinator keeps processing and snapshotting apart per instance
//!
//! ## Architecture
//!
//! ```text
//!            ┌───────────────── node ──────────────────┐
//!  frames    │ ┌──────────┐   ┌──────────┐  ┌────────┐ │
//! ─────────> │ │ Listener │──>│ Dispatch │─>│   PE   │ │
//!            │ └──────────┘   │   pool   │  │registry│ │
//!            │                └──────────┘  └───┬────┘ │
//!            │ ┌──────────┐   ┌──────────┐      │      │
//! <───────── │ │ Emitter  │<──│  Router  │<─────┘      │
//!            │ └──────────┘   └──────────┘  emissions  │
//!            │        Checkpointer ── Coordinator      │
//!            └─────────────────────────────────────────┘
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod assignment;
pub mod channel;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod emitter;
pub mod error;
pub mod event;
pub mod frame;
pub mod listener;
pub mod logging;
pub mod message;
pub mod node;
pub mod partition;
pub mod pe;
pub mod pool;
pub mod registry;
pub mod router;
pub mod worker;

// Re-exports
pub use assignment::{Assignment, AssignmentSnapshot, AssignmentView, ClusterNode};
pub use checkpoint::{CheckpointStorage, Checkpointer, FileSystemStorage, MemoryStorage, NoOpStorage};
pub use codec::{CodecKind, SerializerDeserializer};
pub use config::RuntimeConfig;
pub use coordinator::CheckpointingCoordinator;
pub use emitter::{Emitter, TcpEmitter};
pub use error::{Error, Result};
pub use event::{Event, EventMessage, FieldValue};
pub use listener::{Listener, TcpListener};
pub use node::{Node, NodeBuilder};
pub use partition::{DefaultHasher, Hasher};
pub use pe::{InstanceId, PeError, PeFactory, ProcessContext, ProcessingElement};
pub use registry::PeRegistry;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::assignment::{AssignmentSnapshot, AssignmentView, ClusterNode};
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{Error, Result};
    pub use crate::event::Event;
    pub use crate::node::{Node, NodeBuilder};
    pub use crate::pe::{PeError, ProcessContext, ProcessingElement};
}
