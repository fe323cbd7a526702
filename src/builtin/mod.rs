//! 内置操作：不启动 shell，在进程内执行并输出合成的行
mod confirm;
mod network;
mod update_inventory;
mod wait_restart;

pub use network::{is_cidr, is_private_cidr};
pub use wait_restart::RestartPolicy;

use crate::error::AutomationError;
use crate::hosts::ConnectTarget;
use crate::transport::{EventSender, TransportJob};
use crate::types::BuiltinValue;
use crate::Result;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

/// 封闭的内置操作集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    WaitForServerRestart,
    IsPrivateCidrNetwork,
    IsCidrNetwork,
    UpdateInventory,
    Confirm,
    /// 测试用：输出一行后正常结束
    TestCode0,
}

impl Builtin {
    pub const ALL: [Builtin; 6] = [
        Builtin::WaitForServerRestart,
        Builtin::IsPrivateCidrNetwork,
        Builtin::IsCidrNetwork,
        Builtin::UpdateInventory,
        Builtin::Confirm,
        Builtin::TestCode0,
    ];

    pub fn marker(self) -> &'static str {
        match self {
            Builtin::WaitForServerRestart => "#waitForServerRestart",
            Builtin::IsPrivateCidrNetwork => "#isPrivateCidrNetwork",
            Builtin::IsCidrNetwork => "#isCidrNetwork",
            Builtin::UpdateInventory => "#updateInventory",
            Builtin::Confirm => "#confirm",
            Builtin::TestCode0 => "#builtin-test-code0",
        }
    }
}

impl FromStr for Builtin {
    type Err = AutomationError;

    fn from_str(marker: &str) -> Result<Self> {
        Builtin::ALL
            .into_iter()
            .find(|b| b.marker() == marker.trim())
            .ok_or_else(|| {
                AutomationError::BuiltinError(format!(
                    "This builtin operation doesn't exist: {}",
                    marker
                ))
            })
    }
}

/// 从主机地址和 values 中提取的通用参数，端口缺省为 SSH 端口
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinParameters {
    pub host: String,
    pub port: u16,
    pub timeout_server_offline: Duration,
    pub timeout_server_online: Duration,
}

pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(300);

impl BuiltinParameters {
    pub fn from_target(to_perform: &str, values: &[BuiltinValue]) -> Result<Self> {
        let target = ConnectTarget::parse(to_perform)?;
        let mut params = Self {
            port: target.port_or_default(),
            host: target.address,
            timeout_server_offline: DEFAULT_RESTART_TIMEOUT,
            timeout_server_online: DEFAULT_RESTART_TIMEOUT,
        };

        for value in values {
            let BuiltinValue::Keyed(map) = value else {
                continue;
            };
            for (key, raw) in map {
                let number = integer_value(key, raw)?;
                match key.as_str() {
                    "timeoutServerOnline" => {
                        params.timeout_server_online = Duration::from_secs(number)
                    }
                    "timeoutServerOffline" => {
                        params.timeout_server_offline = Duration::from_secs(number)
                    }
                    "port" => {
                        params.port = u16::try_from(number).map_err(|_| {
                            AutomationError::BuiltinError(format!("port is not valid: {}", number))
                        })?
                    }
                    _ => {}
                }
            }
        }
        Ok(params)
    }
}

fn integer_value(key: &str, raw: &Value) -> Result<u64> {
    let parsed = match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        AutomationError::BuiltinError(format!("The value of {} must be an integer: {}", key, raw))
    })
}

/// 字符串参数
pub fn text_values(values: &[BuiltinValue]) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| match v {
            BuiltinValue::Text(s) => Some(s.clone()),
            BuiltinValue::Keyed(_) => None,
        })
        .collect()
}

/// 按名称分派；返回 Err 时适配器以错误结束
pub async fn dispatch(marker: &str, job: &TransportJob, events: &EventSender) -> Result<()> {
    let builtin = Builtin::from_str(marker)?;
    let values = job.operation.values.clone().unwrap_or_default();
    match builtin {
        Builtin::Confirm => confirm::run(job, events).await,
        Builtin::WaitForServerRestart => {
            let params = BuiltinParameters::from_target(&job.host.to_perform, &values)?;
            wait_restart::run(&params, &RestartPolicy::default(), events).await
        }
        Builtin::IsCidrNetwork => network::run(job, &values, false, events),
        Builtin::IsPrivateCidrNetwork => network::run(job, &values, true, events),
        Builtin::UpdateInventory => update_inventory::run(job, &values, events).await,
        Builtin::TestCode0 => {
            events.stdout("Builtin test code 0");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_marker_round_trip() {
        for builtin in Builtin::ALL {
            assert_eq!(Builtin::from_str(builtin.marker()).unwrap(), builtin);
        }
        let err = Builtin::from_str("#unknown").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Builtin operation failed: This builtin operation doesn't exist: #unknown"
        );
    }

    #[test]
    fn test_parameters_defaults_and_overrides() {
        let params = BuiltinParameters::from_target("10.0.0.1", &[]).unwrap();
        assert_eq!(params.host, "10.0.0.1");
        assert_eq!(params.port, 22);
        assert_eq!(params.timeout_server_online, DEFAULT_RESTART_TIMEOUT);

        let mut map = BTreeMap::new();
        map.insert("timeoutServerOffline".to_string(), serde_json::json!(5));
        map.insert("port".to_string(), serde_json::json!("8080"));
        let params =
            BuiltinParameters::from_target("10.0.0.1:22", &[BuiltinValue::Keyed(map)]).unwrap();
        assert_eq!(params.timeout_server_offline, Duration::from_secs(5));
        assert_eq!(params.port, 8080);
    }

    #[test]
    fn test_parameters_reject_non_integer() {
        let mut map = BTreeMap::new();
        map.insert("timeoutServerOnline".to_string(), serde_json::json!("soon"));
        assert!(BuiltinParameters::from_target("h", &[BuiltinValue::Keyed(map)]).is_err());
    }
}
