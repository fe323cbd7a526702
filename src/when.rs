//! `when` 条件：`$VAR==value`、`$VAR!=value`、`#inv.path==value`

use crate::env::{env_subst, remove_quotes, try_parse_as_json, Environment};
use crate::error::AutomationError;
use crate::inventory::{Inventory, INVENTORY_KEY_PREFIX};
use crate::Result;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    NotEqual,
}

impl Comparator {
    fn token(self) -> &'static str {
        match self {
            Comparator::Equal => "==",
            Comparator::NotEqual => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub lhs: String,
    pub comparator: Comparator,
    pub rhs: String,
}

impl Condition {
    /// 静态语法检查，只看格式不看变量是否存在
    pub fn parse(condition: &str) -> Result<Self> {
        let comparator = [Comparator::Equal, Comparator::NotEqual]
            .into_iter()
            .find(|c| condition.contains(c.token()))
            .ok_or_else(|| {
                AutomationError::ValidationError(format!(
                    "when condition '{}' has no comparator (== or !=)",
                    condition
                ))
            })?;

        let parts: Vec<&str> = condition.split(comparator.token()).collect();
        if parts.len() != 2 {
            return Err(AutomationError::ValidationError(format!(
                "when condition '{}' is malformed, syntax is <$VAR|#inv.path>{}<value>",
                condition,
                comparator.token()
            )));
        }

        let lhs = parts[0].trim();
        if !lhs.starts_with('$') && !lhs.starts_with(INVENTORY_KEY_PREFIX) {
            return Err(AutomationError::ValidationError(format!(
                "when condition '{}': the left side must start with '$' or '{}'",
                condition, INVENTORY_KEY_PREFIX
            )));
        }

        Ok(Self {
            lhs: lhs.to_string(),
            comparator,
            rhs: remove_quotes(parts[1].trim()),
        })
    }

    pub fn is_inventory(&self) -> bool {
        self.lhs.starts_with(INVENTORY_KEY_PREFIX)
    }

    /// 运行期求值；未解析的 `$VAR` 按字面值比较
    pub fn evaluate(&self, environment: &Environment, inventory: Option<&Inventory>) -> bool {
        let resolved = if self.is_inventory() {
            match inventory {
                Some(inventory) => inventory.resolve_attribute_value(&self.lhs, environment),
                None => {
                    debug!("when: {} needs an inventory, condition is false", self.lhs);
                    return false;
                }
            }
        } else {
            try_parse_as_json(&env_subst(&self.lhs, &extended_environment(environment)))
        };
        debug!("when: {} resolved as '{}'", self.lhs, resolved);

        match self.comparator {
            Comparator::Equal => resolved == self.rhs,
            Comparator::NotEqual => resolved != self.rhs,
        }
    }
}

/// 操作环境优先，其次进程环境
fn extended_environment(environment: &Environment) -> Environment {
    let mut extended: Environment = std::env::vars().collect();
    extended.extend(environment.iter().map(|(k, v)| (k.clone(), v.clone())));
    extended
}

/// 解析失败的条件视为不满足
pub fn is_when_condition_match(
    condition: &str,
    environment: &Environment,
    inventory: Option<&Inventory>,
) -> bool {
    match Condition::parse(condition) {
        Ok(parsed) => parsed.evaluate(environment, inventory),
        Err(e) => {
            debug!("when: {}", e);
            false
        }
    }
}
