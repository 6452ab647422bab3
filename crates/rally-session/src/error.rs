//! Error type for session negotiation and transports.

use rally_common::RallyError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("rtc error: {0}")]
    Rtc(String),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl From<SessionError> for RallyError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Signaling(msg) => RallyError::Network(msg),
            other => RallyError::Session(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            SessionError::Rtc("ice failed".into()).to_string(),
            "rtc error: ice failed"
        );
        assert_eq!(
            SessionError::Negotiation("no remote description".into()).to_string(),
            "negotiation error: no remote description"
        );
    }

    #[test]
    fn converts_into_rally_error() {
        let err: RallyError = SessionError::Signaling("refused".into()).into();
        assert!(matches!(err, RallyError::Network(_)));

        let err: RallyError = SessionError::Protocol("bad frame".into()).into();
        assert_eq!(err.to_string(), "session error: protocol error: bad frame");
    }

    #[test]
    fn serde_errors_convert() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SessionError = parse.into();
        assert!(matches!(err, SessionError::Serialization(_)));
    }
}
