pub mod connection;
pub mod correlation;
pub mod directory;
pub mod dispatcher;
pub mod metrics;
pub mod observers;
pub mod transport;

pub use connection::{ClientError, ConnectionState, MessagingClient};
pub use correlation::{CorrelationError, CorrelationRegistry, Outcome, Rejection, Waiter};
pub use directory::{Directory, DirectoryError, StaticDirectory};
pub use dispatcher::{Dispatched, Dispatcher, DropReason, Response, ACL_LIST_ID, AUTH_ID};
pub use observers::{IdObserver, ObserverRegistry, TypeObserver};
pub use transport::{
    Connector, Link, MemoryConnector, Outbound, RelayEnd, TransportError, TransportEvent,
    WebSocketConnector,
};
