pub mod database;
pub mod envelopes;
pub mod error;
pub mod schema;
pub mod sink;

pub use database::Database;
pub use envelopes::{DeadLetterRow, EnvelopeRepo, EnvelopeRow, RecordId};
pub use error::StoreError;
pub use sink::{EnvelopeSink, SqliteSink};
