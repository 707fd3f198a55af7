pub mod protocol;
pub mod transport;
pub mod ws;

pub use transport::{Connector, EventSink, TransportEvent, TransportHandle};
pub use ws::WsConnector;
