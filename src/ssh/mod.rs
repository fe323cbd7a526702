//! 基于 ssh2 的阻塞客户端，调用方需在 `spawn_blocking` 中使用
mod client;
mod file_transfer;
mod hash;

pub use client::SshClient;
