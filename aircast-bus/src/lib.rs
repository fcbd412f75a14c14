//! Stream bus and RPC transport for the aircast control plane.
//!
//! Append-only streams with consumer groups carry the cross-process
//! traffic: RPC request/reply between services and broadcast fan-out to
//! gateways. Backends: in-process ([`stream::MemoryBus`]) and Redis
//! streams ([`stream::RedisBus`]).

pub mod error;
pub mod rpc;
pub mod stream;

pub use error::{Error, Result};
pub use rpc::{parse_params, Envelope, Notifier, Peer, Reply, RpcError};
pub use stream::{
    connect, Consumer, ConsumerMode, Delivery, Fields, MemoryBus, Producer, RedisBus, StreamBus,
    StreamId, StreamMessage, Trimmer,
};
