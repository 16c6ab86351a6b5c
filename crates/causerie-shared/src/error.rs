use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdError {
    #[error("Negative id cannot be encoded: {0}")]
    Negative(i64),

    #[error("Invalid obfuscated id: {0:?}")]
    Invalid(String),

    #[error("Id codec error: {0}")]
    Codec(String),
}

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Bad signature encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Signature has wrong length: {0} bytes")]
    Length(usize),

    #[error("Invalid public key bytes")]
    InvalidKey,

    #[error("Signature does not verify")]
    Mismatch,
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Malformed rpc payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("Malformed params for {method}: {source}")]
    Params {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid id in params: {0}")]
    Id(#[from] IdError),

    #[error("Invalid params: {0}")]
    Invalid(String),
}
