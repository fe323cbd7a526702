use crate::vpn::VpnSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 默认的操作目录（相对 copyTo 源路径的基准）
pub const DEFAULT_OPS_DIRECTORY: &str = "/var/lib/automation-cli";
pub const DEFAULT_LOG_DIRECTORY: &str = "automation-cli.logs";
/// 无活动超时（分钟）
pub const DEFAULT_ACTIVITY_TIMEOUT_MINUTES: u64 = 120;

/// 运行选项，由命令行构建
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOptions {
    pub inventory_file: Option<PathBuf>,
    pub ssh_private_key: Option<PathBuf>,
    pub ssh_passphrase: Option<String>,
    pub sudo: bool,
    pub sudo_password: Option<String>,
    pub activity_timeout_minutes: u64,
    pub ops_directory: PathBuf,
    pub log_directory: PathBuf,
    pub json_report: bool,
    pub vpn: Option<VpnSettings>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            inventory_file: None,
            ssh_private_key: None,
            ssh_passphrase: None,
            sudo: false,
            sudo_password: None,
            activity_timeout_minutes: DEFAULT_ACTIVITY_TIMEOUT_MINUTES,
            ops_directory: std::env::var("OPS")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OPS_DIRECTORY)),
            log_directory: std::env::temp_dir().join(DEFAULT_LOG_DIRECTORY),
            json_report: false,
            vpn: None,
        }
    }
}

impl ExecOptions {
    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_minutes.max(1) * 60)
    }

    /// 日志中隐藏 sudo 密码
    pub fn hide_secrets(&self, text: &str) -> String {
        match self.sudo_password.as_deref() {
            Some(pass) if !pass.is_empty() => text.replace(pass, "*******"),
            _ => text.to_string(),
        }
    }
}

/// 进程级开关：NOLOG / SILENTMODE / QUIETMODE / TESTMODE
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFlags {
    pub silent: bool,
    pub quiet: bool,
    pub nolog: bool,
    pub test_mode: bool,
}

impl RunFlags {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 缺失或空值视为关闭
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = |key: &str| lookup(key).is_some_and(|v| !v.trim().is_empty());
        Self {
            silent: enabled("SILENTMODE"),
            quiet: enabled("QUIETMODE"),
            nolog: enabled("NOLOG"),
            test_mode: enabled("TESTMODE"),
        }
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_run_flags_from_lookup() {
        let vars: HashMap<&str, &str> = [("NOLOG", "1"), ("QUIETMODE", ""), ("TESTMODE", "true")]
            .into_iter()
            .collect();
        let flags = RunFlags::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert!(flags.nolog);
        assert!(!flags.quiet);
        assert!(!flags.silent);
        assert!(flags.test_mode);
    }

    #[test]
    fn test_hide_sudo_password() {
        let options = ExecOptions {
            sudo_password: Some("s3cr3t".to_string()),
            ..Default::default()
        };
        assert_eq!(
            options.hide_secrets("sudo -S bash <<< 's3cr3t'"),
            "sudo -S bash <<< '*******'"
        );
    }
}
