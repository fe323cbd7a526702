use crate::error::AutomationError;
use crate::types::{CommandResult, HostConfig, OutputKind};
use ssh2::Session;
use std::io::prelude::*;
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SSH 客户端
pub struct SshClient {
    pub(super) session: Session,
    pub(super) config: HostConfig,
}

impl SshClient {
    /// 创建新的 SSH 连接（带重试机制）
    pub fn new(config: HostConfig) -> Result<Self, AutomationError> {
        let max_retries = 3;
        let retry_delay = Duration::from_millis(1000);
        let mut last_error = None;

        for attempt in 1..=max_retries {
            if attempt > 1 {
                info!(
                    "Retrying SSH connection to {}:{} (Attempt {}/{})",
                    config.hostname, config.port, attempt, max_retries
                );
                thread::sleep(retry_delay * (attempt as u32 - 1));
            }

            match Self::connect_once(&config) {
                Ok(client) => return Ok(client),
                // 认证失败重试没有意义
                Err(e @ AutomationError::AuthenticationError(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "SSH connection failed for {}:{}: {}. ",
                        config.hostname, config.port, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AutomationError::SshConnectionError("Failed to connect after retries".to_string())
        }))
    }

    /// 执行单次连接尝试
    fn connect_once(config: &HostConfig) -> Result<Self, AutomationError> {
        let address = (config.hostname.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| {
                AutomationError::SshConnectionError(format!(
                    "Failed to resolve {}:{}: {}",
                    config.hostname, config.port, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                AutomationError::SshConnectionError(format!(
                    "No address found for {}",
                    config.hostname
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&address, Duration::from_secs(10)).map_err(|e| {
            AutomationError::SshConnectionError(format!(
                "Failed to connect to {}:{}: {}",
                config.hostname, config.port, e
            ))
        })?;

        // 禁用 Nagle 算法，减少小包延迟
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);

        // 握手超时 10 秒
        session.set_timeout(10000);

        session.handshake().map_err(|e| {
            AutomationError::SshConnectionError(format!("SSH Handshake failed: {}", e))
        })?;

        // 认证
        let auth = if let Some(ref private_key_path) = config.private_key_path {
            let passphrase = config.passphrase.as_deref();
            session.userauth_pubkey_file(
                &config.username,
                None,
                Path::new(private_key_path),
                passphrase,
            )
        } else if let Some(ref password) = config.password {
            session.userauth_password(&config.username, password)
        } else {
            return Err(AutomationError::AuthenticationError(
                "No authentication method provided".to_string(),
            ));
        };
        if let Err(e) = auth {
            return Err(AutomationError::AuthenticationError(format!(
                "{}@{}: {}",
                config.username, config.hostname, e
            )));
        }

        if !session.authenticated() {
            return Err(AutomationError::AuthenticationError(
                "Authentication failed".to_string(),
            ));
        }

        info!("Successfully connected to {}", config.hostname);

        Ok(Self {
            session,
            config: config.clone(),
        })
    }

    /// 执行远程命令
    pub fn execute_command(&self, command: &str) -> Result<CommandResult, AutomationError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        channel.read_to_string(&mut stdout)?;
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        debug!(
            "Command '{}' on '{}' executed with exit code: {}",
            command, self.config.hostname, exit_code
        );

        Ok(CommandResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// 流式执行远程命令，逐行回调，返回退出码
    pub fn execute_streaming<F>(&self, command: &str, mut on_line: F) -> Result<i32, AutomationError>
    where
        F: FnMut(OutputKind, &str),
    {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        // 长时间运行的脚本不能受握手超时限制
        self.session.set_blocking(false);
        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();
        let mut chunk = [0u8; 8192];

        let streamed: Result<(), AutomationError> = (|| {
            loop {
                let mut progressed = false;

                match channel.read(&mut chunk) {
                    Ok(0) => {}
                    Ok(n) => {
                        progressed = true;
                        for line in stdout.push(&chunk[..n]) {
                            on_line(OutputKind::Stdout, &line);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }

                match channel.stderr().read(&mut chunk) {
                    Ok(0) => {}
                    Ok(n) => {
                        progressed = true;
                        for line in stderr.push(&chunk[..n]) {
                            on_line(OutputKind::Stderr, &line);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }

                if !progressed {
                    if channel.eof() {
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(20));
                }
            }
        })();
        self.session.set_blocking(true);
        streamed?;

        if let Some(line) = stdout.finish() {
            on_line(OutputKind::Stdout, &line);
        }
        if let Some(line) = stderr.finish() {
            on_line(OutputKind::Stderr, &line);
        }

        channel.wait_close()?;
        Ok(channel.exit_status()?)
    }
}

/// 把字节块拼接为完整的行
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"hel").is_empty());
        assert_eq!(buffer.push(b"lo\nwor"), vec!["hello".to_string()]);
        assert_eq!(buffer.push(b"ld\n\n"), vec!["world".to_string(), String::new()]);
        assert_eq!(buffer.push(b"tail"), Vec::<String>::new());
        assert_eq!(buffer.finish().as_deref(), Some("tail"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_connect_refused_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = HostConfig {
            hostname: "127.0.0.1".to_string(),
            port,
            private_key_path: Some("/nonexistent".to_string()),
            ..Default::default()
        };
        let err = SshClient::connect_once(&config).err().unwrap();
        assert!(matches!(err, AutomationError::SshConnectionError(_)));
    }
}
