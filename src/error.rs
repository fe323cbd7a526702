use thiserror::Error;
use serde::Serialize;

#[derive(Error, Debug, Clone, Serialize, PartialEq)]
pub enum AutomationError {
    #[error("SSH connection failed: {0}")]
    SshConnectionError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Command execution failed: {0}")]
    CommandExecutionError(String),

    #[error("File operation failed: {0}")]
    FileOperationError(String),

    #[error("Inventory error: {0}")]
    InventoryError(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Environment error: {0}")]
    EnvironmentError(String),

    #[error("Builtin operation failed: {0}")]
    BuiltinError(String),

    #[error("{0}")]
    ProtectedServer(String),

    #[error("Canceled by user")]
    CanceledByUser,

    /// 内部一致性错误（程序缺陷），终止整个运行
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("SSH error: {0}")]
    Ssh2Error(String),
}

impl From<std::io::Error> for AutomationError {
    fn from(error: std::io::Error) -> Self {
        AutomationError::IoError(error.to_string())
    }
}

impl From<ssh2::Error> for AutomationError {
    fn from(error: ssh2::Error) -> Self {
        AutomationError::Ssh2Error(error.to_string())
    }
}

impl From<tera::Error> for AutomationError {
    fn from(error: tera::Error) -> Self {
        AutomationError::TemplateError(error.to_string())
    }
}
