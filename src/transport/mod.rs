//! 统一的执行通道：SSH、本地进程、内置操作
mod builtin;
mod local;
mod ssh;

pub use builtin::BuiltinTransport;
pub use local::LocalTransport;
pub use ssh::SshTransport;

use crate::config::ExecOptions;
use crate::context::RunContext;
use crate::hosts::is_localhost;
use crate::types::{Host, Operation, OutputKind, ShellDescription, ShellOutput};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportKind {
    Ssh,
    Local,
    Builtin,
}

/// 通道事件：若干 Data，最后恰好一个 End
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Data(ShellOutput),
    /// 传输层故障，由编排器转成 End
    Error(String),
    End(Option<String>),
}

/// 一次 (操作, 主机) 执行所需的全部输入
#[derive(Clone)]
pub struct TransportJob {
    pub shell: ShellDescription,
    pub host: Host,
    pub operation: Operation,
    pub options: Arc<ExecOptions>,
    pub ctx: Arc<RunContext>,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl EventSender {
    fn send(&self, event: ConnectionEvent) {
        // 接收端已关闭说明宿主已放弃该主机
        let _ = self.tx.send(event);
    }

    pub fn stdout(&self, message: &str) {
        self.send(ConnectionEvent::Data(ShellOutput::stdout(message)));
    }

    pub fn stderr(&self, message: &str) {
        self.send(ConnectionEvent::Data(ShellOutput::stderr(message)));
    }

    /// 按行拆分输出，忽略空行
    pub fn emit_lines(&self, data: &str, kind: OutputKind) {
        for line in data.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match kind {
                OutputKind::Stdout => self.stdout(line),
                OutputKind::Stderr => self.stderr(line),
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.send(ConnectionEvent::Error(message.to_string()));
    }

    pub fn end(&self, error: Option<String>) {
        self.send(ConnectionEvent::End(error));
    }
}

/// 与传输方式无关的事件句柄
pub struct ConnectionAdapter {
    kind: TransportKind,
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionAdapter {
    pub fn channel(kind: TransportKind) -> (EventSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSender { tx },
            Self {
                kind,
                rx,
                task: None,
            },
        )
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// 所有发送端都关闭后返回 None
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

impl Drop for ConnectionAdapter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// 开始执行并返回事件流；返回 Err 表示尚未开始就失败
    async fn start(&self, job: TransportJob) -> Result<ConnectionAdapter>;
}

/// 内置标记优先，其次本机，其余走 SSH
pub fn select_kind(operation: &Operation, host: &Host) -> TransportKind {
    if operation.is_builtin() {
        TransportKind::Builtin
    } else if is_localhost(&host.to_perform) {
        TransportKind::Local
    } else {
        TransportKind::Ssh
    }
}

pub trait TransportSelector: Send + Sync {
    fn select(&self, operation: &Operation, host: &Host) -> Arc<dyn Transport>;
}

pub struct DefaultTransportSelector {
    ssh: Arc<dyn Transport>,
    local: Arc<dyn Transport>,
    builtin: Arc<dyn Transport>,
}

impl Default for DefaultTransportSelector {
    fn default() -> Self {
        Self {
            ssh: Arc::new(SshTransport),
            local: Arc::new(LocalTransport),
            builtin: Arc::new(BuiltinTransport),
        }
    }
}

impl TransportSelector for DefaultTransportSelector {
    fn select(&self, operation: &Operation, host: &Host) -> Arc<dyn Transport> {
        match select_kind(operation, host) {
            TransportKind::Ssh => self.ssh.clone(),
            TransportKind::Local => self.local.clone(),
            TransportKind::Builtin => self.builtin.clone(),
        }
    }
}

/// sudo 包装：有密码时通过 stdin 传入
pub fn build_shell_command(
    bash_parameters: &str,
    options: &ExecOptions,
    shell: &str,
    sudo_shell: Option<&str>,
) -> String {
    let mut command = if bash_parameters.is_empty() {
        String::new()
    } else {
        format!("{} ", bash_parameters.trim_end())
    };
    if options.sudo {
        let target = sudo_shell.unwrap_or(shell);
        match options.sudo_password.as_deref() {
            Some(pass) if !pass.is_empty() => {
                command.push_str(&format!("sudo -k -p \"\" -S -E {} <<< '{}'", target, pass));
            }
            _ => command.push_str(&format!("sudo -E {}", target)),
        }
    } else {
        command.push_str(shell);
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_kind() {
        let local = Host::new("me", "127.0.0.1");
        let remote = Host::new("web", "10.0.0.1");
        let command = Operation::command("c", "echo hi");
        let builtin = Operation::builtin("b", "#isCidrNetwork", vec![]);

        assert_eq!(select_kind(&command, &local), TransportKind::Local);
        assert_eq!(select_kind(&command, &remote), TransportKind::Ssh);
        assert_eq!(select_kind(&builtin, &remote), TransportKind::Builtin);
        assert_eq!(
            select_kind(&command, &Host::new("me", "localhost:2222")),
            TransportKind::Ssh
        );
    }

    #[test]
    fn test_build_shell_command_sudo() {
        let mut options = ExecOptions::default();
        assert_eq!(build_shell_command("A=\"1\" ", &options, "bash x", None), "A=\"1\" bash x");

        options.sudo = true;
        assert_eq!(
            build_shell_command("", &options, "cmd", Some("bash -c \"cmd\"")),
            "sudo -E bash -c \"cmd\""
        );
        options.sudo_password = Some("pw".to_string());
        assert_eq!(
            build_shell_command("", &options, "bash x", None),
            "sudo -k -p \"\" -S -E bash x <<< 'pw'"
        );
    }

    #[tokio::test]
    async fn test_emit_lines_skips_empty() {
        let (events, mut adapter) = ConnectionAdapter::channel(TransportKind::Local);
        events.emit_lines("a\n\nb\n", OutputKind::Stdout);
        events.end(None);
        drop(events);

        let mut received = Vec::new();
        while let Some(event) = adapter.next_event().await {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                ConnectionEvent::Data(ShellOutput::stdout("a")),
                ConnectionEvent::Data(ShellOutput::stdout("b")),
                ConnectionEvent::End(None),
            ]
        );
    }
}
