//! Request-reply transport between the coordinator and its workers.
//!
//! Every worker gets a dedicated channel from the coordinator; all workers
//! reply on one shared channel back. Endpoints discover each other through a
//! [`NameResolver`](crate::name_resolve::NameResolver).

mod buffer;
pub mod codec;
mod master;
mod net;
mod payload;
mod worker;

pub use buffer::ResponseBuffer;
pub use master::CoordinatorEndpoint;
pub use net::host_ip;
pub use payload::{decode, encode, Handler, Hook, Payload, ReplyPattern, ShardId};
pub use worker::WorkerEndpoint;
