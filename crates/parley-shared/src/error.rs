use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Message must contain either text or media")]
    EmptyMessage,

    #[error("Message text must not exceed {max} characters (got {len})")]
    TextTooLong { len: usize, max: usize },

    #[error("A conversation needs at least 2 distinct members (got {0})")]
    TooFewMembers(usize),

    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}
