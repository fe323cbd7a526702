use super::{build_shell_command, ConnectionAdapter, EventSender, Transport, TransportJob, TransportKind};
use crate::config::ExecOptions;
use crate::env::{bash_parameters, env_subst};
use crate::error::AutomationError;
use crate::hosts::{ConnectTarget, HostConfigBuilder};
use crate::inventory::Inventory;
use crate::shell::{audit_hook, protected_server_check};
use crate::ssh::SshClient;
use crate::types::ShellDescription;
use crate::utils::{expand_home, remote_destination, remove_file_quietly, resolve_local_source};
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SSH_DEFAULT_PRIVATE_KEY_FILES: [&str; 6] = [
    "id_dsa",
    "id_ecdsa",
    "id_ecdsa_sk",
    "id_ed25519",
    "id_ed25519_sk",
    "id_rsa",
];

/// 通过 ssh2 在远程主机执行；阻塞调用放在 spawn_blocking 中
pub struct SshTransport;

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    async fn start(&self, job: TransportJob) -> Result<ConnectionAdapter> {
        let (events, adapter) = ConnectionAdapter::channel(TransportKind::Ssh);
        let task = tokio::spawn(async move {
            let worker_events = events.clone();
            let tmp_file = job.shell.tmp_file.clone();
            let outcome =
                tokio::task::spawn_blocking(move || run_over_ssh(&job, &worker_events)).await;
            if let Some(tmp) = tmp_file.as_deref() {
                remove_file_quietly(tmp);
            }
            match outcome {
                Ok(Ok(0)) => events.end(None),
                Ok(Ok(code)) => events.end(Some(format!("bash exiting with code: {}", code))),
                Ok(Err(e)) => events.error(&e.to_string()),
                Err(e) => events.error(&format!("SSH worker failed: {}", e)),
            }
        });
        Ok(adapter.with_task(task))
    }
}

fn run_over_ssh(job: &TransportJob, events: &EventSender) -> Result<i32> {
    let TransportJob {
        shell,
        host,
        operation,
        options,
        ctx,
    } = job;
    let target = ConnectTarget::parse(host.connect_target())?;
    let inventory = ctx.inventory_snapshot()?;
    let (private_key, passphrase) = resolve_credentials(options, inventory.as_deref())?;

    let config = HostConfigBuilder::from_target(&target)
        .private_key_path(&private_key.to_string_lossy())
        .passphrase(passphrase.as_deref())
        .build();
    ctx.logger.host_event(
        &host.user_input,
        &format!(
            "[INFO] Connecting to {}@{}:{}",
            config.username, config.hostname, config.port
        ),
    );

    let client = match SshClient::new(config) {
        Ok(client) => client,
        Err(e @ AutomationError::AuthenticationError(_)) => {
            events.stderr(&format!(
                "{} - Check your SSH private key, or provide one with the option --sshpk",
                e
            ));
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    // copyTo 先于脚本
    for item in operation.copy_to.iter().flatten() {
        if item.src.is_empty() {
            continue;
        }
        let src = resolve_local_source(&options.ops_directory, &operation.name, &item.src);
        let dest = remote_destination(&item.dest, &item.src);
        let transfer = client
            .upload_file(&src.to_string_lossy(), &dest, item.chmod.as_deref())
            .map_err(|e| {
                AutomationError::FileOperationError(format!(
                    "Copy failed {} -> {}:{}: {}",
                    src.display(),
                    host.user_input,
                    dest,
                    e
                ))
            })?;
        ctx.logger.host_event(
            &host.user_input,
            &format!(
                "[INFO] File copied: {} -> {} ({} bytes, {})",
                src.display(),
                dest,
                transfer.bytes_transferred,
                transfer.message
            ),
        );
    }

    let remote_script = match shell.tmp_file.as_deref() {
        Some(tmp) => {
            let dest = remote_script_path(tmp);
            let transfer = client.upload_file(tmp, &dest, Some("700"))?;
            remove_file_quietly(tmp);
            ctx.logger.host_event(
                &host.user_input,
                &format!(
                    "[INFO] Script uploaded to {} ({} bytes)",
                    dest, transfer.bytes_transferred
                ),
            );
            Some(dest)
        }
        None => None,
    };

    let command = remote_command(shell, remote_script.as_deref(), operation, options);
    ctx.logger.host_event(
        &host.user_input,
        &format!("Instructions to execute: {}", options.hide_secrets(&command)),
    );
    debug!("SSH exec on {}", host.user_input);

    let code = client.execute_streaming(&command, |kind, line| events.emit_lines(line, kind))?;
    info!("{} finished with exit code {}", host.user_input, code);
    Ok(code)
}

/// 本地临时脚本在远程 /tmp 下的名字
fn remote_script_path(tmp: &str) -> String {
    let name = Path::new(tmp)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| tmp.to_string());
    format!("/tmp/{}A", name)
}

fn remote_command(
    shell: &ShellDescription,
    remote_script: Option<&str>,
    operation: &crate::types::Operation,
    options: &ExecOptions,
) -> String {
    let parameters = bash_parameters(&operation.environment);
    let run = match remote_script {
        Some(script) => format!("bash \"{}\"", script),
        None => format!(
            "bash -c \"{} && {} && {}\"",
            protected_server_check(),
            audit_hook(&format!("operation: {}", operation.name)),
            shell.shell_instructions
        ),
    };
    build_shell_command(&parameters, options, &run, None)
}

/// 私钥：命令行 > 清单 sshpk > ~/.ssh 默认文件
fn resolve_credentials(
    options: &ExecOptions,
    inventory: Option<&Inventory>,
) -> Result<(PathBuf, Option<String>)> {
    let inventory_passphrase = inventory.and_then(|i| i.resolve_scalar("sshpass"));
    let passphrase = options.ssh_passphrase.clone().or(inventory_passphrase);

    if let Some(key) = options.ssh_private_key.as_ref() {
        return Ok((key.clone(), passphrase));
    }

    if let Some(sshpk) = inventory.and_then(|i| i.resolve_scalar("sshpk")) {
        let process_env = std::env::vars().collect();
        let resolved = env_subst(&sshpk, &process_env);
        let path = if resolved.starts_with("./") {
            options.ops_directory.join(resolved.trim_start_matches("./"))
        } else {
            expand_home(&resolved)
        };
        return Ok((path, passphrase));
    }

    let ssh_dir = expand_home("~/.ssh");
    SSH_DEFAULT_PRIVATE_KEY_FILES
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.exists())
        .map(|path| (path, passphrase))
        .ok_or_else(|| {
            AutomationError::AuthenticationError(format!(
                "No SSH private key found in {}, use the option --sshpk",
                ssh_dir.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;

    #[test]
    fn test_remote_script_path() {
        assert_eq!(remote_script_path("/var/tmp/abc.tmp"), "/tmp/abc.tmpA");
    }

    #[test]
    fn test_remote_command_for_literal_command() {
        let operation = Operation::command("op", "uptime").with_env("A", "1");
        let shell = ShellDescription {
            shell_instructions: "uptime".to_string(),
            ..Default::default()
        };
        let command = remote_command(&shell, None, &operation, &ExecOptions::default());
        assert!(command.starts_with("A=\"1\" bash -c \"if [ -f '/mytinydc-runtime-protection.lock' ]"));
        assert!(command.ends_with("&& uptime\""));
    }

    #[test]
    fn test_remote_command_for_script_with_sudo() {
        let operation = Operation::scripts("op", vec!["x.sh".to_string()]);
        let options = ExecOptions {
            sudo: true,
            sudo_password: Some("pw".to_string()),
            ..Default::default()
        };
        let command = remote_command(&ShellDescription::default(), Some("/tmp/s.tmpA"), &operation, &options);
        assert_eq!(command, "sudo -k -p \"\" -S -E bash \"/tmp/s.tmpA\" <<< 'pw'");
    }

    #[test]
    fn test_explicit_private_key_wins() {
        let options = ExecOptions {
            ssh_private_key: Some(PathBuf::from("/keys/id")),
            ssh_passphrase: Some("pp".to_string()),
            ..Default::default()
        };
        let (key, pass) = resolve_credentials(&options, None).unwrap();
        assert_eq!(key, PathBuf::from("/keys/id"));
        assert_eq!(pass.as_deref(), Some("pp"));
    }
}
