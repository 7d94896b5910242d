//! Error types for frame parsing and the wire contract

use thiserror::Error;

/// Errors that can occur when parsing a radar UART frame
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Line contains no recognized fields
    #[error("Empty frame")]
    Empty,

    /// Field is not a `key=value` pair
    #[error("Field '{0}' has no '=' separator")]
    MissingSeparator(String),

    /// Key is not part of the frame schema
    #[error("Unknown key '{0}'")]
    UnknownKey(String),

    /// Value failed numeric conversion
    #[error("Invalid value '{value}' for key '{key}'")]
    InvalidValue { key: String, value: String },

    /// Alert string is not one of the three known levels
    #[error("Unknown alert level '{0}'")]
    UnknownAlert(String),

    /// Line exceeded the maximum frame length without a terminator
    #[error("Frame too long: {0} bytes without a newline")]
    FrameTooLong(usize),

    /// Frame bytes are not valid UTF-8
    #[error("Invalid frame encoding")]
    InvalidEncoding,
}

/// Errors that can occur when encoding or decoding broker records
#[derive(Error, Debug)]
pub enum ContractError {
    /// Record did not serialize to a JSON object
    #[error("Record does not serialize to an object")]
    NotAnObject,

    /// Envelope is missing the `schema` tag
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// Payload did not match the schema it claims
    #[error("Malformed '{schema}' record: {source}")]
    Malformed {
        schema: String,
        #[source]
        source: serde_json::Error,
    },
}
