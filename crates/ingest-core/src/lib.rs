pub mod decode;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod state;

pub use decode::{DecodedPayload, DecoderKind, PayloadDecoder};
pub use envelope::EventEnvelope;
pub use errors::{DecodeError, IngestError, TransportError};
pub use ids::ConnectionId;
pub use state::{SessionState, StateCell};
