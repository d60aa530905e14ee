pub mod config;
pub mod envelope;
pub mod error;
pub mod new_message;
pub mod store;
pub mod stored;
pub mod types;

pub use config::SpoolConfig;
pub use envelope::{Envelope, Recipient};
pub use error::{EnvelopeError, Result, StoreError};
pub use new_message::NewMessage;
pub use store::{MessageStore, Recovery, StoreIter};
pub use stored::{Content, StoredMessage};
pub use types::MessageId;
