//! WireGuard 隧道：匹配的主机改为经本地转发端口连接

use crate::error::AutomationError;
use crate::inventory::Inventory;
use crate::types::Host;
use crate::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const LOCAL_FORWARD_HOST: &str = "127.0.0.1";
const OBFUSCATED: &str = "*******";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpnSettings {
    pub wireguard_server_address: String,
    pub wireguard_server_port: u16,
    pub wireguard_server_public_key: String,
    pub wireguard_your_private_key: String,
    pub wireguard_your_ip_address: String,
    /// 作用于 `to_perform` 的正则
    pub wireguard_match: String,
}

impl VpnSettings {
    /// 清单 `internalVpn` 块，缺任何一项返回 None
    pub fn from_inventory(inventory: &Inventory) -> Option<Self> {
        let block = inventory.content().get("internalVpn")?;
        let settings: VpnSettings = serde_json::from_value(block.clone())
            .map_err(|e| debug!("internalVpn block ignored: {}", e))
            .ok()?;
        settings.is_complete().then_some(settings)
    }

    pub fn is_complete(&self) -> bool {
        !self.wireguard_server_address.is_empty()
            && self.wireguard_server_port != 0
            && !self.wireguard_server_public_key.is_empty()
            && !self.wireguard_your_private_key.is_empty()
            && !self.wireguard_your_ip_address.is_empty()
            && !self.wireguard_match.is_empty()
    }
}

#[async_trait]
pub trait VpnTunnel: Send {
    /// 返回隧道进程 pid；没有主机需要隧道时返回 None
    async fn start(&mut self, hosts: &mut [Host], settings: &VpnSettings) -> Result<Option<u32>>;

    async fn close(&mut self);
}

/// 通过 `onetun` 二进制建立隧道
pub struct OnetunVpn {
    binary: PathBuf,
    child: Option<Child>,
}

impl OnetunVpn {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            child: None,
        }
    }

    /// `<ops>/vpn/bin-wireguard/onetun`
    pub fn from_ops_directory(ops_directory: &std::path::Path) -> Self {
        Self::new(ops_directory.join("vpn").join("bin-wireguard").join("onetun"))
    }
}

/// 为匹配的主机分配本地端口并改写连接地址，返回 onetun 的端点参数
pub fn assign_forwarders(hosts: &mut [Host], pattern: &str) -> Result<Vec<String>> {
    let matcher = Regex::new(pattern).map_err(|e| {
        AutomationError::ValidationError(format!("wireguardMatch is not a valid regex: {}", e))
    })?;
    let mut endpoints = Vec::new();
    for host in hosts.iter_mut().filter(|h| matcher.is_match(&h.to_perform)) {
        let port = free_local_port()?;
        let target = match host.to_perform.split(':').nth(1) {
            Some(p) if !p.is_empty() => host.to_perform.clone(),
            _ => format!("{}:22", host.to_perform),
        };
        host.to_perform_over_vpn = Some(format!("{}:{}", LOCAL_FORWARD_HOST, port));
        info!("Creating endPoint for host: {}/{}", host.user_input, host.to_perform);
        endpoints.push(format!("{}:{}:{}", LOCAL_FORWARD_HOST, port, target));
    }
    Ok(endpoints)
}

fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((LOCAL_FORWARD_HOST, 0))?;
    Ok(listener.local_addr()?.port())
}

fn onetun_arguments(settings: &VpnSettings, endpoints: &[String]) -> Vec<String> {
    let mut args = vec![
        "--private-key".to_string(),
        settings.wireguard_your_private_key.clone(),
        "--endpoint-addr".to_string(),
        format!(
            "{}:{}",
            settings.wireguard_server_address, settings.wireguard_server_port
        ),
        "--endpoint-public-key".to_string(),
        settings.wireguard_server_public_key.clone(),
        "--source-peer-ip".to_string(),
        settings.wireguard_your_ip_address.clone(),
        "--keep-alive".to_string(),
        "25".to_string(),
    ];
    args.extend(endpoints.iter().cloned());
    args
}

/// 日志中隐藏密钥
fn obfuscate(args: &[String]) -> String {
    let mut hide_next = false;
    args.iter()
        .map(|arg| {
            let shown = if hide_next { OBFUSCATED } else { arg.as_str() };
            hide_next = arg == "--private-key" || arg == "--endpoint-public-key";
            shown
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl VpnTunnel for OnetunVpn {
    async fn start(&mut self, hosts: &mut [Host], settings: &VpnSettings) -> Result<Option<u32>> {
        if hosts.is_empty() || !settings.is_complete() {
            return Ok(None);
        }
        let endpoints = assign_forwarders(hosts, &settings.wireguard_match)?;
        if endpoints.is_empty() {
            return Ok(None);
        }

        let args = onetun_arguments(settings, &endpoints);
        info!("command {} {}", self.binary.display(), obfuscate(&args));
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AutomationError::CommandExecutionError(format!(
                    "Failed to start VPN tunnel {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;
        let pid = child.id();

        for stream in [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
        ]
        .into_iter()
        .flatten()
        {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("(pid:{:?}) onetun: {}", pid, line);
                }
            });
        }

        info!(
            "VPN connection {}:{} port forward: {} pid:{:?}",
            settings.wireguard_server_address,
            settings.wireguard_server_port,
            endpoints.join(" "),
            pid
        );
        self.child = Some(child);
        Ok(pid)
    }

    async fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("killing VPN process (PID: {:?})", child.id());
        if let Err(e) = child.kill().await {
            warn!("Unable to kill VPN process: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> VpnSettings {
        VpnSettings {
            wireguard_server_address: "203.0.113.1".to_string(),
            wireguard_server_port: 51820,
            wireguard_server_public_key: "PUB".to_string(),
            wireguard_your_private_key: "PRIV".to_string(),
            wireguard_your_ip_address: "10.8.0.2".to_string(),
            wireguard_match: r"^10\.20\.".to_string(),
        }
    }

    #[test]
    fn test_assign_forwarders_only_matching_hosts() {
        let mut hosts = vec![
            Host::new("internal", "10.20.0.5"),
            Host::new("internal-port", "10.20.0.6:2222"),
            Host::new("public", "198.51.100.7"),
        ];
        let endpoints = assign_forwarders(&mut hosts, &settings().wireguard_match).unwrap();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints[0].ends_with(":10.20.0.5:22"));
        assert!(endpoints[1].ends_with(":10.20.0.6:2222"));
        assert!(hosts[0]
            .to_perform_over_vpn
            .as_deref()
            .unwrap()
            .starts_with("127.0.0.1:"));
        assert_eq!(hosts[2].to_perform_over_vpn, None);
        assert_eq!(hosts[2].connect_target(), "198.51.100.7");
    }

    #[test]
    fn test_obfuscate_keys() {
        let args = onetun_arguments(&settings(), &["127.0.0.1:4000:10.20.0.5:22".to_string()]);
        let shown = obfuscate(&args);
        assert!(!shown.contains("PRIV"));
        assert!(!shown.contains("PUB"));
        assert!(shown.contains("--endpoint-addr 203.0.113.1:51820"));
    }

    #[tokio::test]
    async fn test_incomplete_settings_do_not_start() {
        let mut vpn = OnetunVpn::new(PathBuf::from("/nonexistent/onetun"));
        let mut hosts = vec![Host::new("h", "10.20.0.5")];
        let pid = vpn.start(&mut hosts, &VpnSettings::default()).await.unwrap();
        assert_eq!(pid, None);
        assert_eq!(hosts[0].to_perform_over_vpn, None);
    }

    #[test]
    fn test_settings_from_inventory() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"internalVpn:\n  wireguardServerAddress: 203.0.113.1\n  wireguardServerPort: 51820\n  wireguardServerPublicKey: PUB\n  wireguardYourPrivateKey: PRIV\n  wireguardYourIpAddress: 10.8.0.2\n  wireguardMatch: '^10\\.20\\.'\n",
        )
        .unwrap();
        let inventory = Inventory::load(file.path()).unwrap();
        assert_eq!(VpnSettings::from_inventory(&inventory), Some(settings()));
    }
}
