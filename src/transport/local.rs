use super::{
    build_shell_command, ConnectionAdapter, EventSender, Transport, TransportJob, TransportKind,
};
use crate::config::ExecOptions;
use crate::env::process_environment;
use crate::error::AutomationError;
use crate::shell::{audit_hook, protected_server_line2, PROTECTED_SERVER_LINE1, PROTECTED_SERVER_MARK};
use crate::types::{Operation, OutputKind, ShellDescription};
use crate::utils::{parse_chmod, remove_file_quietly, resolve_local_source};
use crate::Result;
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 在本机通过 bash 执行
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn start(&self, job: TransportJob) -> Result<ConnectionAdapter> {
        let TransportJob {
            shell,
            host,
            operation,
            options,
            ctx,
        } = job;
        ctx.logger
            .host_event(&host.user_input, "[INFO] Using local terminal");

        if let Err(e) = prepare(&operation, &options) {
            remove_tmp(&shell);
            return Err(e);
        }

        let args = spawn_args(&shell, &options, &operation);
        ctx.logger.host_event(
            &host.user_input,
            &format!("Instructions to execute: bash {}", options.hide_secrets(&args.join(" "))),
        );
        debug!("Local spawn for {}: bash {}", host.user_input, options.hide_secrets(&args.join(" ")));

        let spawned = Command::new("bash")
            .args(&args)
            .env_clear()
            .envs(process_environment(&operation.environment))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                remove_tmp(&shell);
                return Err(AutomationError::CommandExecutionError(format!(
                    "Failed to spawn bash: {}",
                    e
                )));
            }
        };

        let (events, adapter) = ConnectionAdapter::channel(TransportKind::Local);
        let task = tokio::spawn(async move {
            tokio::join!(
                forward_lines(child.stdout.take(), OutputKind::Stdout, events.clone()),
                forward_lines(child.stderr.take(), OutputKind::Stderr, events.clone()),
            );

            let status = child.wait().await;
            remove_tmp(&shell);
            match status {
                Ok(status) if status.success() => events.end(None),
                Ok(status) => events.end(Some(format!(
                    "bash exiting with code: {}",
                    status.code().unwrap_or(-1)
                ))),
                Err(e) => events.end(Some(format!("bash failed: {}", e))),
            }
        });

        Ok(adapter.with_task(task))
    }
}

/// 按字节读到 EOF，每行有损解码；读出错时丢弃剩余输出但不关闭管道
async fn forward_lines<R>(stream: Option<R>, kind: OutputKind, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => events.emit_lines(&String::from_utf8_lossy(&line), kind),
            Err(e) => {
                warn!("Unable to read {:?} of local process: {}", kind, e);
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    debug!("draining {:?} stopped: {}", kind, e);
                }
                return;
            }
        }
    }
}

fn remove_tmp(shell: &ShellDescription) {
    if let Some(tmp) = shell.tmp_file.as_deref() {
        remove_file_quietly(tmp);
    }
}

/// copyTo 与受保护主机检查
fn prepare(operation: &Operation, options: &ExecOptions) -> Result<()> {
    for item in operation.copy_to.iter().flatten() {
        if item.src.is_empty() {
            continue;
        }
        let src = resolve_local_source(&options.ops_directory, &operation.name, &item.src);
        let copy = std::fs::copy(&src, &item.dest).and_then(|_| match item.chmod.as_deref().and_then(parse_chmod) {
            Some(mode) => std::fs::set_permissions(&item.dest, std::fs::Permissions::from_mode(mode)),
            None => Ok(()),
        });
        if let Err(e) = copy {
            return Err(AutomationError::FileOperationError(format!(
                "Failed to copy {} to {}: {}",
                src.display(),
                item.dest,
                e
            )));
        }
        info!("File copied locally: {} -> {}", src.display(), item.dest);
    }

    if Path::new(PROTECTED_SERVER_MARK).exists() {
        return Err(AutomationError::ProtectedServer(format!(
            "{} {}",
            PROTECTED_SERVER_LINE1,
            protected_server_line2()
        )));
    }
    Ok(())
}

fn spawn_args(shell: &ShellDescription, options: &ExecOptions, operation: &Operation) -> Vec<String> {
    let hook = audit_hook(&format!("operation: {}", operation.name));
    match shell.tmp_file.as_deref() {
        Some(tmp) if !options.sudo => vec![tmp.to_string()],
        Some(tmp) => vec![
            "-c".to_string(),
            build_shell_command("", options, tmp, Some(&format!("bash \"{}\"", tmp))),
        ],
        None => {
            let inline = format!("{} && {}", hook, shell.shell_instructions);
            vec![
                "-c".to_string(),
                build_shell_command("", options, &inline, Some(&format!("bash -c \"{}\"", inline))),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_args() {
        let operation = Operation::command("op", "echo hi");
        let options = ExecOptions::default();

        let command = ShellDescription {
            shell_instructions: "echo hi".to_string(),
            ..Default::default()
        };
        let args = spawn_args(&command, &options, &operation);
        assert_eq!(args[0], "-c");
        assert!(args[1].ends_with("&& echo hi"));

        let script = ShellDescription {
            tmp_file: Some("/tmp/x.tmp".to_string()),
            ..Default::default()
        };
        assert_eq!(spawn_args(&script, &options, &operation), vec!["/tmp/x.tmp"]);

        let sudo = ExecOptions {
            sudo: true,
            ..Default::default()
        };
        assert_eq!(
            spawn_args(&script, &sudo, &operation),
            vec!["-c", "sudo -E bash \"/tmp/x.tmp\""]
        );
    }

    #[test]
    fn test_prepare_copies_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.conf");
        let dest = dir.path().join("dest.conf");
        std::fs::write(&src, "content").unwrap();

        let mut operation = Operation::command("op", "true");
        operation.copy_to = Some(vec![crate::types::CopyTo {
            src: src.to_string_lossy().into_owned(),
            dest: dest.to_string_lossy().into_owned(),
            chmod: Some("600".to_string()),
        }]);
        prepare(&operation, &ExecOptions::default()).unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "content");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_prepare_reports_missing_source() {
        let mut operation = Operation::command("op", "true");
        operation.copy_to = Some(vec![crate::types::CopyTo {
            src: "/nonexistent/source".to_string(),
            dest: "/tmp/never".to_string(),
            chmod: None,
        }]);
        let err = prepare(&operation, &ExecOptions::default()).unwrap_err();
        assert!(matches!(err, AutomationError::FileOperationError(_)));
    }
}
