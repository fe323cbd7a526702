pub mod builtin;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod hosts;
pub mod inventory;
pub mod log;
pub mod orchestrator;
pub mod report;
pub mod shell;
pub mod ssh;
pub mod steps;
pub mod transport;
pub mod types;
pub mod ui;
pub mod utils;
pub mod validate;
pub mod vpn;
pub mod when;


pub use config::{ExecOptions, RunFlags};
pub use context::RunContext;
pub use error::AutomationError;
pub use hosts::{resolve_hosts, HostConfigBuilder};
pub use inventory::{Inventory, InventoryHandle};
pub use orchestrator::{load_operations, OperationRunner, RunSummary};
pub use report::{ReportCollector, RunReport};
pub use ssh::SshClient;
pub use transport::{
    ConnectionAdapter, ConnectionEvent, DefaultTransportSelector, Transport, TransportKind,
    TransportSelector,
};
pub use types::{BuiltinValue, CopyTo, Host, HostConfig, Operation, ShellDescription, ShellOutput};
pub use validate::{prepare_operations, validate_operations};
pub use vpn::{OnetunVpn, VpnSettings, VpnTunnel};

// 便捷的重新导出
pub type Result<T> = std::result::Result<T, AutomationError>;
