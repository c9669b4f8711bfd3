pub mod bus;
pub mod config;
pub mod connection;
pub mod presence;
pub mod queue;
pub mod rest;
pub mod session;
pub mod store;
pub mod transport;

pub use bus::{EventBus, Subscription};
pub use config::{ConfigError, SessionConfig, load_config_from_path, save_config_to_path};
pub use connection::{
    ConnectionHandle, ConnectionState, Credentials, LinkEvent, LinkSettings, LinkStats, Outbox,
};
pub use presence::{PresenceDiff, PresenceSettings, PresenceTracker};
pub use queue::OutboundQueue;
pub use rest::{ChatSummary, HttpRestClient, RestApi, RestError};
pub use session::Session;
pub use store::{StoreSettings, TimelineError, TimelineStore};
pub use transport::{
    Connector, FrameSource, OutboundFrame, RemoteEnd, TransportError, TransportEvent,
    TransportLink, WriteCount, WsConnector,
};
