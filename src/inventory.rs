use crate::env::{env_subst, get_nested, remove_quotes, value_to_plain_string, Environment};
use crate::error::AutomationError;
use crate::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub const INVENTORY_KEY_PREFIX: &str = "#inv.";

pub fn is_inventory_key(value: &str) -> bool {
    remove_quotes(value.trim()).starts_with(INVENTORY_KEY_PREFIX)
}

/// 清单文档（已解密）
#[derive(Debug, Clone)]
pub struct Inventory {
    path: PathBuf,
    content: Value,
    /// sops 加密时使用的 age 公钥
    age_recipient: Option<String>,
}

impl Inventory {
    /// 读取清单；带 `sops` 键的文档通过 `sops --decrypt` 解密
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(AutomationError::InventoryError("Inventory file not set".to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AutomationError::InventoryError(format!(
                "Inventory file was not found: {} ({})",
                path.display(),
                e
            ))
        })?;
        let parsed = parse_yaml(&raw)?;

        if parsed.get("sops").is_none() {
            return Ok(Self {
                path: path.to_path_buf(),
                content: parsed,
                age_recipient: None,
            });
        }

        debug!("Inventory content seems to be encrypted with SOPS, trying to decrypt");
        let age_recipient = get_nested(&parsed, "sops.age[0].recipient")
            .and_then(Value::as_str)
            .map(str::to_string);
        let output = Command::new("sops")
            .arg("--decrypt")
            .arg(path)
            .output()
            .map_err(|e| AutomationError::InventoryError(format!("Failed to run sops: {}", e)))?;
        if !output.status.success() {
            return Err(AutomationError::InventoryError(format!(
                "sops failed to decrypt {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let content = parse_yaml(&String::from_utf8_lossy(&output.stdout))?;

        Ok(Self {
            path: path.to_path_buf(),
            content,
            age_recipient,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn is_encrypted(&self) -> bool {
        self.age_recipient.is_some()
    }

    /// 只返回标量值
    pub fn resolve_scalar(&self, attribute: &str) -> Option<String> {
        match get_nested(&self.content, attribute)? {
            Value::String(s) => Some(s.clone()),
            v @ (Value::Number(_) | Value::Bool(_)) => Some(v.to_string()),
            _ => None,
        }
    }

    /// `#inv.path.$host.key` -> 清单中的值；对象返回 JSON，缺失返回空串
    pub fn resolve_attribute_value(&self, value: &str, environment: &Environment) -> String {
        let stripped = remove_quotes(value.trim());
        let path = stripped
            .strip_prefix(INVENTORY_KEY_PREFIX)
            .unwrap_or(stripped.as_str());
        let path = env_subst(path, environment);
        debug!("resolveInventoryAttributeValue: value interpolated: {}", path);
        get_nested(&self.content, &path)
            .map(value_to_plain_string)
            .unwrap_or_default()
    }

    /// 写回文档，原文档加密时重新加密
    pub fn write(&self, content: Value) -> Result<Inventory> {
        let yaml = serde_yaml::to_string(&content).map_err(|e| {
            AutomationError::InventoryError(format!("Failed to serialize inventory: {}", e))
        })?;

        let to_write = match &self.age_recipient {
            Some(recipient) => self.encrypt(&yaml, recipient)?,
            None => yaml,
        };
        std::fs::write(&self.path, to_write).map_err(|e| {
            AutomationError::InventoryError(format!(
                "Failed to write inventory {}: {}",
                self.path.display(),
                e
            ))
        })?;

        if self.age_recipient.is_some() {
            let check = Inventory::load(&self.path)?;
            if !check.is_encrypted() {
                return Err(AutomationError::InventoryError(
                    "Impossible to continue, Inventory file encryption chain broken".to_string(),
                ));
            }
        }
        info!("Inventory {} written", self.path.display());

        Ok(Inventory {
            path: self.path.clone(),
            content,
            age_recipient: self.age_recipient.clone(),
        })
    }

    fn encrypt(&self, yaml: &str, recipient: &str) -> Result<String> {
        let temp = PathBuf::from(format!("{}.tmp.yaml", self.path.display()));
        std::fs::write(&temp, yaml)?;
        let output = Command::new("sops")
            .args(["encrypt", "--age", recipient])
            .arg(&temp)
            .output();
        let _ = std::fs::remove_file(&temp);
        let output =
            output.map_err(|e| AutomationError::InventoryError(format!("Failed to run sops: {}", e)))?;
        if !output.status.success() {
            return Err(AutomationError::InventoryError(format!(
                "sops failed to encrypt the inventory: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_yaml(raw: &str) -> Result<Value> {
    let value: Option<Value> = serde_yaml::from_str(raw)
        .map_err(|e| AutomationError::InventoryError(format!("Failed to parse YAML: {}", e)))?;
    Ok(value.unwrap_or(Value::Null))
}

/// 运行期间共享的清单句柄；更新后刷新缓存
#[derive(Debug)]
pub struct InventoryHandle {
    path: PathBuf,
    cache: Mutex<Option<Arc<Inventory>>>,
}

impl InventoryHandle {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Result<Arc<Inventory>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| AutomationError::InternalError("inventory cache poisoned".to_string()))?;
        if let Some(inventory) = cache.as_ref() {
            return Ok(inventory.clone());
        }
        let inventory = Arc::new(Inventory::load(&self.path)?);
        *cache = Some(inventory.clone());
        Ok(inventory)
    }

    /// 读取-修改-写回，整个过程持有锁
    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Value) -> Result<()>,
    {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| AutomationError::InternalError("inventory cache poisoned".to_string()))?;
        let current = Inventory::load(&self.path)?;
        let mut content = current.content().clone();
        mutate(&mut content)?;
        let written = current.write(content)?;
        *cache = Some(Arc::new(written));
        Ok(())
    }
}
