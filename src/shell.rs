use crate::error::AutomationError;
use crate::types::{Operation, ShellDescription};
use crate::utils::generate_local_temp_path;
use crate::Result;
use std::time::Instant;
use tera::{Context, Tera};
use tracing::{debug, warn};

/// 目标主机上存在此文件时拒绝执行
pub const PROTECTED_SERVER_MARK: &str = "/mytinydc-runtime-protection.lock";
pub const PROTECTED_SERVER_LINE1: &str =
    "This server is protected against 'automation-cli' operations.";
pub const AUDIT_TAG: &str = "automation-cli";

const INTERNAL_FUNCTIONS_TEMPLATE: &str =
    include_str!("../assets/internal_functions.bash.tera");

pub fn protected_server_line2() -> String {
    format!(
        "To perform an 'operation' on this server, delete the file {}",
        PROTECTED_SERVER_MARK
    )
}

/// 单引号内安全的文本
fn single_quoted(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// syslog 审计钩子，logger 不存在时不影响执行
pub fn audit_hook(message: &str) -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!(
        "(command -v logger >/dev/null 2>&1 && logger -p 'local6.debug' -t '{}' {} || true)",
        AUDIT_TAG,
        single_quoted(&format!("[{}] {}", user, message))
    )
}

/// 命令行模式下使用的受保护主机检查
pub fn protected_server_check() -> String {
    format!(
        "if [ -f '{}' ];then echo {} >&2;echo {} >&2;exit 2;fi",
        PROTECTED_SERVER_MARK,
        single_quoted(PROTECTED_SERVER_LINE1),
        single_quoted(&protected_server_line2())
    )
}

fn remove_shebang(content: &str) -> &str {
    if content.starts_with("#!") {
        content.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
    } else {
        content
    }
}

/// 把操作渲染为可传输的脚本
pub struct ShellBuilder {
    internal_functions: String,
}

impl ShellBuilder {
    pub fn new() -> Result<Self> {
        let mut context = Context::new();
        context.insert("marker", PROTECTED_SERVER_MARK);
        context.insert("line1", PROTECTED_SERVER_LINE1);
        context.insert("line2", &protected_server_line2());
        let internal_functions = Tera::one_off(INTERNAL_FUNCTIONS_TEMPLATE, &context, false)?;
        Ok(Self { internal_functions })
    }

    /// 构建脚本；脚本模式会写入临时文件，由调用方负责删除
    pub fn build_shell(&self, operation: &Operation, host_label: &str) -> Result<ShellDescription> {
        let started = Instant::now();

        if let Some(command) = operation.command.as_deref().filter(|c| !c.trim().is_empty()) {
            return Ok(ShellDescription {
                shell_instructions: command.to_string(),
                tmp_file: None,
                time_to_build_ms: started.elapsed().as_millis(),
            });
        }

        if !operation.has_scripts() {
            return Err(AutomationError::InternalError(format!(
                "[SERIOUS ERROR] The pre-check process did not detect that operation '{}' has neither 'command' nor 'scripts'",
                operation.name
            )));
        }

        let shell_instructions = self.render_script(operation, host_label)?;
        let tmp_file = generate_local_temp_path("rs_automation_shell");
        std::fs::write(&tmp_file, &shell_instructions).map_err(|e| {
            AutomationError::FileOperationError(format!(
                "Failed to write shell file {}: {}",
                tmp_file, e
            ))
        })?;
        debug!("buildShell: shell written to {}", tmp_file);

        Ok(ShellDescription {
            shell_instructions,
            tmp_file: Some(tmp_file),
            time_to_build_ms: started.elapsed().as_millis(),
        })
    }

    /// 脚本内容只取决于操作和主机标签
    pub fn render_script(&self, operation: &Operation, host_label: &str) -> Result<String> {
        let mut shell: Vec<String> = vec![
            "#!/usr/bin/env bash".to_string(),
            format!("# built for {}", host_label),
        ];

        // 变量值在运行时注入，不写入脚本
        if !operation.environment.is_empty() {
            shell.push("\n#[WARN] These variables must be declared before running this shell".to_string());
            for key in operation.environment.keys() {
                shell.push(format!("# -e {}=\"(Real value is hidden)\"", key));
            }
            shell.push("####\n".to_string());
        }

        shell.push(audit_hook(&format!("operation: {}", operation.name)));
        shell.push("if [ -d /etc/profile.d ]; then source /etc/profile;fi".to_string());
        shell.push("set -euo pipefail".to_string());
        shell.push("set -o history -o histexpand".to_string());
        shell.push("profileCorporateProxy=\"/etc/profile.d/proxy.sh\"".to_string());
        shell.push("if [ -f \"$profileCorporateProxy\" ];then".to_string());
        shell.push("  . \"$profileCorporateProxy\"".to_string());
        shell.push("fi".to_string());
        // 脚本启动后删除自身
        shell.push("if [ -f \"$0\" ];then rm -f \"$0\";fi".to_string());
        shell.push(self.internal_functions.trim_end().to_string());
        shell.push("checkIsServerProtected".to_string());
        shell.push("export APT_KEY_DONT_WARN_ON_DANGEROUS_USAGE=\"DontWarn\"".to_string());
        shell.push("export DEBIAN_FRONTEND=\"noninteractive\"".to_string());

        if !operation.dependencies.is_empty() {
            shell.push("\n# ==> Your manifest contains package dependencies".to_string());
            shell.push(format!("debInstall \"{}\"\n##\n", operation.dependencies.join(" ")));
        }

        shell.push("# ==> Starting your shell instructions".to_string());
        for script in operation.scripts.iter().flatten() {
            let content = match std::fs::read_to_string(script) {
                Ok(content) => content,
                Err(e) => {
                    warn!("buildShell: script {} skipped: {}", script, e);
                    continue;
                }
            };
            shell.push(format!("# ===> Adding the script:: {}", script));
            shell.push(remove_shebang(&content).trim_end_matches('\n').to_string());
            shell.push(format!("# <=== End of script: {}", script));
        }
        shell.push("# Ending your shell instructions".to_string());

        Ok(shell.join("\n"))
    }
}
