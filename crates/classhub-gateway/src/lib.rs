pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod oracle;
pub mod persistence;
pub mod registry;
pub mod signaling;
pub mod store;

pub use dispatcher::Dispatcher;
pub use error::{GatewayError, RegistryError, StoreError};
pub use registry::ConnectionRegistry;
pub use store::{RetryPolicy, RoomStateStore};
