use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// 一个操作：命令行、脚本列表或内置操作三者之一
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, alias = "script", skip_serializing_if = "Option::is_none")]
    pub scripts: Option<Vec<String>>,
    /// 内置操作标记，以 `#` 开头
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_scalar_map")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_to: Option<Vec<CopyTo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_hosts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
    #[serde(default)]
    pub nolog: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<BuiltinValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<OperationParameters>,
}

impl Operation {
    pub fn command(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    pub fn scripts(name: &str, scripts: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            scripts: Some(scripts),
            ..Default::default()
        }
    }

    pub fn builtin(name: &str, marker: &str, values: Vec<BuiltinValue>) -> Self {
        Self {
            name: name.to_string(),
            operation: Some(marker.to_string()),
            values: Some(values),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn limit_to(mut self, hosts: Vec<String>) -> Self {
        self.limit_hosts = Some(hosts);
        self
    }

    pub fn when(mut self, condition: &str) -> Self {
        self.when = Some(condition.to_string());
        self
    }

    pub fn register_as(mut self, register: &str) -> Self {
        self.register = Some(register.to_string());
        self
    }

    /// 是否为内置操作
    pub fn is_builtin(&self) -> bool {
        self.operation
            .as_deref()
            .is_some_and(|marker| marker.starts_with('#'))
    }

    pub fn has_scripts(&self) -> bool {
        self.scripts.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// 参数是否声明为必需
    pub fn is_required(&self, key: &str) -> bool {
        self.parameters
            .as_ref()
            .is_some_and(|p| p.required.contains_key(key))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CopyTo {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chmod: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationParameters {
    #[serde(default)]
    pub required: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub optional: BTreeMap<String, ParameterSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParameterSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// 内置操作参数：字符串或键值对（如 `{timeoutServerOnline: 10}`）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BuiltinValue {
    Text(String),
    Keyed(BTreeMap<String, serde_json::Value>),
}

impl From<&str> for BuiltinValue {
    fn from(value: &str) -> Self {
        BuiltinValue::Text(value.to_string())
    }
}

/// 目标主机
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    /// 用户输入（或清单解析后）的主机标识，用于日志、报告和 limitHosts 匹配
    pub user_input: String,
    /// 实际连接地址 `address[:port[:login]]`
    pub to_perform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_perform_over_vpn: Option<String>,
}

impl Host {
    pub fn new(user_input: &str, to_perform: &str) -> Self {
        Self {
            user_input: user_input.to_string(),
            to_perform: to_perform.to_string(),
            to_perform_over_vpn: None,
        }
    }

    /// 实际用于连接的地址（VPN 优先）
    pub fn connect_target(&self) -> &str {
        self.to_perform_over_vpn
            .as_deref()
            .unwrap_or(&self.to_perform)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShellDescription {
    pub shell_instructions: String,
    pub tmp_file: Option<String>,
    pub time_to_build_ms: u128,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellOutput {
    pub output: OutputKind,
    pub message: String,
}

impl ShellOutput {
    pub fn stdout(message: &str) -> Self {
        Self {
            output: OutputKind::Stdout,
            message: message.to_string(),
        }
    }

    pub fn stderr(message: &str) -> Self {
        Self {
            output: OutputKind::Stderr,
            message: message.to_string(),
        }
    }
}

/// 主机在某个操作上失败的记录
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HostOperationError {
    pub host: String,
    pub operation_error: Option<String>,
}

/// SSH 登录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub passphrase: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 22,
            username: "root".to_string(),
            password: None,
            private_key_path: None,
            passphrase: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferResult {
    pub bytes_transferred: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHashInfo {
    pub hash: String,
    pub size: u64,
}

/// YAML 中的环境变量值可能是数字或布尔值，统一转成字符串
fn deserialize_scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}
