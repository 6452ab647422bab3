pub mod errors;
pub mod id;

pub use errors::{ConfigError, RallyError};
pub use id::{new_id, short_id, ParticipantId, SessionId};

pub type Result<T> = std::result::Result<T, RallyError>;
