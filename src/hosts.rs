use crate::error::AutomationError;
use crate::inventory::{Inventory, INVENTORY_KEY_PREFIX};
use crate::types::{Host, HostConfig};
use crate::Result;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_LOGIN: &str = "root";

/// `address[:port[:login]]` 拆分结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub address: String,
    pub port: Option<u16>,
    pub login: Option<String>,
}

impl ConnectTarget {
    pub fn parse(to_perform: &str) -> Result<Self> {
        let mut parts = to_perform.trim().splitn(3, ':');
        let address = parts.next().unwrap_or_default().to_string();
        if address.is_empty() {
            return Err(AutomationError::ValidationError(format!(
                "Host is empty: '{}'",
                to_perform
            )));
        }
        let port = match parts.next().filter(|p| !p.is_empty()) {
            Some(port) => Some(port.parse::<u16>().map_err(|_| {
                AutomationError::ValidationError(format!(
                    "Port is not valid for host '{}'",
                    to_perform
                ))
            })?),
            None => None,
        };
        let login = parts
            .next()
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        Ok(Self {
            address,
            port,
            login,
        })
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    pub fn login_or_default(&self) -> &str {
        self.login.as_deref().unwrap_or(DEFAULT_SSH_LOGIN)
    }
}

/// localhost / 127.0.0.1，端口缺省或为 22
pub fn is_localhost(to_perform: &str) -> bool {
    match ConnectTarget::parse(to_perform) {
        Ok(target) => {
            matches!(target.address.as_str(), "localhost" | "127.0.0.1")
                && target.port.is_none_or(|p| p == DEFAULT_SSH_PORT)
        }
        Err(_) => false,
    }
}

/// 根据命令行主机参数构建主机列表，必要时通过清单 `serversGroups` 展开
pub fn resolve_hosts(inputs: &[String], inventory: Option<&Inventory>) -> Result<Vec<Host>> {
    let candidates = match inventory {
        None => inputs.iter().map(|h| Host::new(h, h)).collect(),
        Some(inventory) => resolve_from_inventory(inputs, inventory)?,
    };

    // userInput 与 toPerform 均去重
    let mut hosts: Vec<Host> = Vec::new();
    for host in candidates {
        if host.user_input.trim().is_empty() {
            continue;
        }
        if hosts
            .iter()
            .any(|h| h.user_input == host.user_input || h.to_perform == host.to_perform)
        {
            debug!("Duplicate host removed: {}", host.user_input);
            continue;
        }
        hosts.push(host);
    }
    Ok(hosts)
}

fn resolve_from_inventory(inputs: &[String], inventory: &Inventory) -> Result<Vec<Host>> {
    let groups = inventory
        .content()
        .get("serversGroups")
        .filter(|g| g.is_object())
        .ok_or_else(|| {
            AutomationError::InventoryError(format!(
                "You provided an inventory file: {}, but it does not contain the attribute 'serversGroups' or 'serversGroups' attribute is empty",
                inventory.path().display()
            ))
        })?;

    let mut hosts = Vec::new();
    for input in inputs {
        let name = input
            .strip_prefix(INVENTORY_KEY_PREFIX)
            .and_then(|n| n.strip_prefix("serversGroups."))
            .unwrap_or(input);
        let resolved = browse_groups(groups, name, 0);
        if name == "all" || resolved.len() > 1 {
            hosts.extend(resolved);
        } else {
            let to_perform = resolved
                .into_iter()
                .next()
                .map(|h| h.to_perform)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| input.clone());
            hosts.push(Host::new(input, &to_perform));
        }
    }
    Ok(hosts)
}

/// 递归展开主机组
fn browse_groups(groups: &Value, name: &str, depth: usize) -> Vec<Host> {
    if depth > 16 {
        return Vec::new();
    }
    match groups.get(name) {
        Some(Value::Array(members)) => members
            .iter()
            .filter_map(Value::as_str)
            .flat_map(|member| browse_groups(groups, member, depth + 1))
            .collect(),
        Some(Value::String(target)) => {
            // `name: alias` 形式，alias 本身可能是只有一个元素的组
            let to_perform = match groups.get(target.as_str()) {
                Some(Value::Array(single)) if single.len() == 1 => single[0]
                    .as_str()
                    .unwrap_or(target)
                    .to_string(),
                Some(Value::String(other)) => other.clone(),
                _ => target.clone(),
            };
            vec![Host::new(name, &to_perform)]
        }
        _ => vec![Host::new(name, name)],
    }
}

#[derive(Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
        }
    }

    pub fn from_target(target: &ConnectTarget) -> Self {
        Self::new()
            .hostname(&target.address)
            .port(target.port_or_default())
            .username(target.login_or_default())
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.config.hostname = hostname.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn username(mut self, username: &str) -> Self {
        self.config.username = username.to_string();
        self
    }

    pub fn private_key_path(mut self, path: &str) -> Self {
        self.config.private_key_path = Some(path.to_string());
        self
    }

    pub fn passphrase(mut self, passphrase: Option<&str>) -> Self {
        self.config.passphrase = passphrase.map(str::to_string);
        self
    }

    pub fn build(self) -> HostConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_target() {
        let t = ConnectTarget::parse("10.0.0.1:2222:admin").unwrap();
        assert_eq!(t.address, "10.0.0.1");
        assert_eq!(t.port, Some(2222));
        assert_eq!(t.login_or_default(), "admin");

        let t = ConnectTarget::parse("server").unwrap();
        assert_eq!(t.port_or_default(), 22);
        assert_eq!(t.login_or_default(), "root");

        assert!(ConnectTarget::parse("host:notaport").is_err());
    }

    #[test]
    fn test_is_localhost() {
        assert!(is_localhost("127.0.0.1"));
        assert!(is_localhost("localhost:22"));
        assert!(!is_localhost("127.0.0.1:2222"));
        assert!(!is_localhost("10.0.0.1"));
    }

    #[test]
    fn test_resolve_hosts_dedupe() {
        let inputs = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let hosts = resolve_hosts(&inputs, None).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0], Host::new("a", "a"));
    }

    #[test]
    fn test_resolve_hosts_from_inventory() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"serversGroups:\n  web:\n    - web1\n    - web2\n  web1: 10.0.0.1\n  web2: 10.0.0.2:2222\n  db: dbalias\n  dbalias: ['10.0.0.9']\n",
        )
        .unwrap();
        let inventory = Inventory::load(file.path()).unwrap();

        let hosts = resolve_hosts(&["web".to_string()], Some(&inventory)).unwrap();
        assert_eq!(
            hosts,
            vec![Host::new("web1", "10.0.0.1"), Host::new("web2", "10.0.0.2:2222")]
        );

        let hosts = resolve_hosts(&["db".to_string(), "unknown".to_string()], Some(&inventory))
            .unwrap();
        assert_eq!(
            hosts,
            vec![Host::new("db", "10.0.0.9"), Host::new("unknown", "unknown")]
        );
    }

    #[test]
    fn test_host_config_builder() {
        let target = ConnectTarget::parse("192.168.1.100:2222:deploy").unwrap();
        let config = HostConfigBuilder::from_target(&target)
            .private_key_path("/home/user/.ssh/id_ed25519")
            .passphrase(None)
            .build();
        assert_eq!(config.hostname, "192.168.1.100");
        assert_eq!(config.port, 2222);
        assert_eq!(config.username, "deploy");
        assert!(config.password.is_none());
    }
}
