//! 运行前检查：任何一项失败都在接触主机之前终止整个运行

use crate::builtin::Builtin;
use crate::env::{value_to_plain_string, Environment};
use crate::error::AutomationError;
use crate::inventory::is_inventory_key;
use crate::types::{BuiltinValue, Host, Operation};
use crate::utils::parse_chmod;
use crate::when::Condition;
use crate::Result;
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::debug;

/// 命令行 `-e` 覆盖操作环境，再用参数默认值补齐缺失项
pub fn prepare_operations(operations: &mut [Operation], cli_environment: &Environment) {
    for operation in operations.iter_mut() {
        for (key, value) in cli_environment {
            operation.environment.insert(key.clone(), value.clone());
        }
        let Some(parameters) = operation.parameters.as_ref() else {
            continue;
        };
        let defaults: Vec<(String, String)> = parameters
            .required
            .iter()
            .chain(parameters.optional.iter())
            .filter_map(|(key, spec)| {
                let value = value_to_plain_string(spec.default.as_ref()?);
                (!value.is_empty()).then(|| (key.clone(), value))
            })
            .collect();
        for (key, value) in defaults {
            operation.environment.entry(key).or_insert(value);
        }
    }
}

/// 收集全部错误后一次性返回
pub fn validate_operations(
    operations: &[Operation],
    hosts: &[Host],
    inventory_provided: bool,
) -> Result<()> {
    let mut errors = Vec::new();
    let mut registered: BTreeSet<String> = BTreeSet::new();

    if operations.is_empty() {
        errors.push("There is no operation to process".to_string());
    }

    for (idx, operation) in operations.iter().enumerate() {
        let label = if operation.name.trim().is_empty() {
            format!("#{}", idx)
        } else {
            operation.name.clone()
        };
        let mut fail = |message: String| {
            errors.push(format!("Operation: '{}' (index: {}) - {}", label, idx, message))
        };

        if operation.name.trim().is_empty() {
            fail("The 'name' attribute is mandatory on an operation".to_string());
        }

        let has_command = operation
            .command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        let kinds = [has_command, operation.has_scripts(), operation.operation.is_some()]
            .into_iter()
            .filter(|k| *k)
            .count();
        if kinds != 1 {
            fail("exactly one of 'command', 'scripts' or 'operation' must be provided".to_string());
        }

        if let Some(marker) = operation.operation.as_deref() {
            match Builtin::from_str(marker) {
                Ok(Builtin::Confirm) if hosts.len() > 1 => fail(format!(
                    "The builtin operation #confirm can only run with 1 host, {} hosts provided",
                    hosts.len()
                )),
                Ok(Builtin::UpdateInventory) if !inventory_provided => fail(
                    "#updateInventory needs to interact with an inventory file, inventory file must be provided"
                        .to_string(),
                ),
                Ok(_) => {}
                Err(_) => fail(format!("Builtin operation: '{}' doesn't exist", marker)),
            }
        }

        if let Some(when) = operation.when.as_deref() {
            if let Err(e) = Condition::parse(when) {
                fail(format!("contains 'when' attribute with a malformed value: {}", e));
            }
            if is_inventory_key(when.trim()) && !inventory_provided {
                fail(format!(
                    "contains a condition when referring to an inventory: {}, inventory file must be provided",
                    when
                ));
            }
        }

        if !inventory_provided {
            for (key, value) in &operation.environment {
                if is_inventory_key(value) {
                    fail(format!(
                        "contains an environment variable referring to an inventory: {}={}, inventory file must be provided",
                        key, value
                    ));
                }
            }
            for value in operation.values.iter().flatten() {
                if let BuiltinValue::Text(text) = value {
                    if is_inventory_key(text) {
                        fail(format!(
                            "contains a value referring to an inventory: {}, inventory file must be provided",
                            text
                        ));
                    }
                }
            }
        }

        for item in operation.copy_to.iter().flatten() {
            if item.src.trim().is_empty() {
                fail(format!("copyTo item needs attribute 'src' (dest: {})", item.dest));
            }
            if item.dest.trim().is_empty() {
                fail(format!("copyTo item needs attribute 'dest' (src: {})", item.src));
            }
            if let Some(mode) = item.chmod.as_deref() {
                if parse_chmod(mode).is_none() {
                    fail(format!(
                        "copyTo item has attribute 'chmod': '{}', must be a 3-digit character string (unix like permissions) eg: '755'",
                        mode
                    ));
                }
            }
            if (is_inventory_key(&item.src) || is_inventory_key(&item.dest)) && !inventory_provided {
                fail(format!(
                    "contains copyTo referring to an inventory: {} -> {}, inventory file must be provided",
                    item.src, item.dest
                ));
            }
        }

        if let Some(parameters) = operation.parameters.as_ref() {
            for key in parameters.required.keys() {
                let provided = operation
                    .environment
                    .get(key)
                    .is_some_and(|v| !v.is_empty());
                if !provided && !registered.contains(key) {
                    fail(format!("the required environment variable '{}' is missing", key));
                }
            }
        }

        if let Some(register) = operation.register.as_deref() {
            let name = register.split(':').next().unwrap_or_default().trim();
            if !name.is_empty() {
                registered.insert(name.to_string());
            }
        }
    }

    if errors.is_empty() {
        debug!("{} operations validated", operations.len());
        return Ok(());
    }
    Err(AutomationError::ValidationError(errors.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CopyTo, OperationParameters, ParameterSpec};

    fn hosts(n: usize) -> Vec<Host> {
        (0..n)
            .map(|i| Host::new(&format!("h{}", i), &format!("10.0.0.{}", i + 1)))
            .collect()
    }

    fn required(keys: &[&str], default: Option<&str>) -> OperationParameters {
        let mut parameters = OperationParameters::default();
        for key in keys {
            parameters.required.insert(
                key.to_string(),
                ParameterSpec {
                    kind: Some("string".to_string()),
                    default: default.map(|d| serde_json::json!(d)),
                    ..Default::default()
                },
            );
        }
        parameters
    }

    #[test]
    fn test_valid_operations() {
        let ops = vec![
            Operation::command("a", "uptime").when("$A==1"),
            Operation::builtin("b", "#isCidrNetwork", vec!["10.0.0.0/8".into()]),
        ];
        validate_operations(&ops, &hosts(2), false).unwrap();
    }

    #[test]
    fn test_errors_are_collected() {
        let mut both = Operation::command("both", "uptime");
        both.scripts = Some(vec!["x.sh".to_string()]);
        let ops = vec![
            Operation::default(),
            both,
            Operation::builtin("bad", "#nope", vec![]),
            Operation::command("w", "ls").when("A=1"),
        ];
        let err = validate_operations(&ops, &hosts(1), false).unwrap_err();
        let AutomationError::ValidationError(message) = err else {
            panic!("expected a validation error");
        };
        assert_eq!(message.lines().count(), 5);
        assert!(message.contains("The 'name' attribute is mandatory"));
        assert!(message.contains("Builtin operation: '#nope' doesn't exist"));
        assert!(message.contains("malformed value"));
    }

    #[test]
    fn test_confirm_with_many_hosts() {
        let ops = vec![Operation::builtin("c", "#confirm", vec![])];
        assert!(validate_operations(&ops, &hosts(1), false).is_ok());
        assert!(validate_operations(&ops, &hosts(2), false).is_err());
    }

    #[test]
    fn test_inventory_references_need_inventory() {
        let ops = vec![Operation::command("a", "ls").with_env("IP", "#inv.hosts.web.ip")];
        assert!(validate_operations(&ops, &hosts(1), false).is_err());
        assert!(validate_operations(&ops, &hosts(1), true).is_ok());
    }

    #[test]
    fn test_copy_to_checks() {
        let mut op = Operation::command("a", "ls");
        op.copy_to = Some(vec![
            CopyTo {
                src: "f".to_string(),
                dest: "/tmp/f".to_string(),
                chmod: Some("7550".to_string()),
            },
            CopyTo {
                src: String::new(),
                dest: "/tmp/g".to_string(),
                chmod: None,
            },
        ]);
        let err = validate_operations(&[op], &hosts(1), false).unwrap_err();
        assert_eq!(err.to_string().lines().count(), 2);
    }

    #[test]
    fn test_required_parameters_sources() {
        let mut missing = Operation::command("need", "echo $TOKEN");
        missing.parameters = Some(required(&["TOKEN"], None));
        assert!(validate_operations(&[missing.clone()], &hosts(1), false).is_err());

        // 前一个操作 register 的变量
        let producer = Operation::command("produce", "echo t").register_as("TOKEN");
        validate_operations(&[producer, missing.clone()], &hosts(1), false).unwrap();

        // 命令行 -e
        let mut ops = vec![missing.clone()];
        let cli: Environment = [("TOKEN".to_string(), "x".to_string())].into_iter().collect();
        prepare_operations(&mut ops, &cli);
        validate_operations(&ops, &hosts(1), false).unwrap();

        // 默认值
        let mut with_default = Operation::command("need", "echo $TOKEN");
        with_default.parameters = Some(required(&["TOKEN"], Some("abc")));
        let mut ops = vec![with_default];
        prepare_operations(&mut ops, &Environment::new());
        assert_eq!(ops[0].environment.get("TOKEN").map(String::as_str), Some("abc"));
        validate_operations(&ops, &hosts(1), false).unwrap();
    }

    #[test]
    fn test_cli_environment_overrides_operation() {
        let mut ops = vec![Operation::command("a", "ls").with_env("A", "yaml")];
        let cli: Environment = [("A".to_string(), "cli".to_string())].into_iter().collect();
        prepare_operations(&mut ops, &cli);
        assert_eq!(ops[0].environment.get("A").map(String::as_str), Some("cli"));
    }
}
