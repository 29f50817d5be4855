//! Delivery layer: credential rotation, the transport seam, and the final
//! relay to requesters.

pub mod credentials;
pub mod dispatcher;
pub mod router;
pub mod transport;

pub use credentials::{CredentialState, DeliveryCredential};
pub use dispatcher::{DeliveryDispatcher, DispatcherConfig};
pub use router::ResultRouter;
pub use transport::{DeliveryTransport, HttpDeliveryTransport, ResultRef, SendError};
