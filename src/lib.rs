//! Channel Dispatcher: priority filter matching and staged dispatch for
//! a real-time communications session manager.
//!
//! [`dispatcher::Dispatcher`] is the root object. It owns a
//! [`registry::ClientRegistry`], speaks to clients through a
//! [`bus::BusConnection`], and walks each batch of channels through
//! [`dispatch::pipeline::run`]: internal filters, observers, approvers,
//! then a handler.

pub mod bus;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod operation;
pub mod recovery;
pub mod registry;
pub mod request;
pub mod value;

pub use channel::{Channel, ChannelPath, ChannelStatus};
pub use dispatcher::{Dispatcher, Notification};
pub use error::{DispatchError, OperationError, RegistryError, RequestError};
pub use registry::ClientRegistry;
