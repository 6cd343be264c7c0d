//! Request/response protocol between log consuming workers and the process owning the
//! node connection, plus a broadcast channel for freshly produced logs.
//!
//! Per network there are three destinations on the broker:
//! - `<network>:tasks:requests`, where every client publishes its task requests;
//! - `<network>:tasks:responses:<client name>`, one per client, where the server
//!   publishes the outcome of that client's tasks;
//! - the `<network>:broadcast` fanout exchange, carrying new logs and server restarts.

mod broker;
mod client;
mod messages;
mod redis_broker;
mod server;
mod watcher;

pub use self::broker::{Broker, Deliveries, InMemoryBroker};
pub use self::client::{RouterClient, RouterClientEvent};
pub use self::messages::{RouterBroadcast, TaskRouterRequest, TaskRouterResponse};
pub use self::redis_broker::RedisBroker;
pub use self::server::{RouterServer, RouterServerOptions};
pub use self::watcher::NewLogsWatcher;

pub fn requests_queue(network: &str) -> String {
    format!("{}:tasks:requests", network)
}

pub fn responses_queue(network: &str, client_name: &str) -> String {
    format!("{}:tasks:responses:{}", network, client_name)
}

pub fn broadcast_exchange(network: &str) -> String {
    format!("{}:broadcast", network)
}
