//! Facade over the Jetstream workspace: the reflective model layer plus
//! the protocol client.

pub use jetstream_model::error::{CodecError, ModelError, ScopeError};
pub use jetstream_model::fragment::{FragmentKind, SyncFragment};
pub use jetstream_model::model::{CollectionChange, ModelObject, ParentLink, PropertyChange};
pub use jetstream_model::model_class;
pub use jetstream_model::schema::{ClassSchema, PropertySchema, registry};
pub use jetstream_model::scope::Scope;
pub use jetstream_model::signal::Signal;
pub use jetstream_model::value::{PropertyValue, Timestamp, TypeTag};

pub use jetstream_client::client::{Client, ClientStatus};
pub use jetstream_client::error::{ClientError, FetchError, TransportError};
pub use jetstream_client::memory::{MemoryAdapter, MemoryServer, ServerConnection};
pub use jetstream_client::message::{ErrorPayload, Message, PROTOCOL_VERSION};
pub use jetstream_client::session::Session;
pub use jetstream_client::transport::{Transport, TransportAdapter, TransportStatus};
pub use jetstream_client::websocket::WebSocketAdapter;
