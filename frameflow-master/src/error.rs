use crate::storage::StorageError;
use frameflow_api_grpc::proto::frameflow::common::CommandResult;

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("{0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("metadata decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MasterError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub fn ok_result() -> CommandResult {
    CommandResult {
        success: true,
        msg: String::new(),
    }
}

pub fn error_result(msg: impl Into<String>) -> CommandResult {
    CommandResult {
        success: false,
        msg: msg.into(),
    }
}

impl From<MasterError> for CommandResult {
    fn from(value: MasterError) -> Self {
        error_result(value.to_string())
    }
}
