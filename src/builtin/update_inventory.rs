use crate::env::{
    env_subst_strict, get_nested, has_variable, remove_quotes, set_nested, value_to_plain_string,
    Environment,
};
use crate::error::AutomationError;
use crate::transport::{EventSender, TransportJob};
use crate::types::BuiltinValue;
use crate::Result;
use serde_json::Value;
use tracing::debug;

/// 每行 `key=value`，key 与 value 都可以引用环境变量；
/// value 形如 `$VAR.a.b` 时从 `$VAR` 的 JSON 内容中取 `a.b`
pub(super) async fn run(
    job: &TransportJob,
    values: &[BuiltinValue],
    events: &EventSender,
) -> Result<()> {
    if values.is_empty() {
        return Err(AutomationError::BuiltinError(
            "The inventory has NOT been updated, because operation doesn't include attribute 'values'. eg: values:\n  - key1.key2.key3=[value which could be environment variable name]"
                .to_string(),
        ));
    }
    let Some(path) = job.ctx.inventory.as_ref().map(|h| h.path().to_path_buf()) else {
        return Err(AutomationError::BuiltinError(
            "The inventory has NOT been updated, no inventory file was provided".to_string(),
        ));
    };

    let mut updates = Vec::with_capacity(values.len());
    for value in values {
        let BuiltinValue::Text(line) = value else {
            return Err(AutomationError::BuiltinError(
                "Values item must be string type".to_string(),
            ));
        };
        updates.push(parse_update(line, &job.operation.environment)?);
    }

    // 读写文件并可能调用 sops，不占用运行时线程
    let ctx = job.ctx.clone();
    tokio::task::spawn_blocking(move || {
        let Some(handle) = ctx.inventory.as_ref() else {
            return Ok(());
        };
        handle.update(|content| {
            for (key, value) in &updates {
                debug!("updateInventory: {} = {}", key, value);
                set_nested(content, key, Value::String(value.clone()));
            }
            Ok(())
        })
    })
    .await
    .map_err(|e| AutomationError::InternalError(format!("Inventory update task failed: {}", e)))??;
    events.stdout(&format!("[INFO] {} has been updated", path.display()));
    Ok(())
}

fn parse_update(line: &str, environment: &Environment) -> Result<(String, String)> {
    let parts: Vec<&str> = line.split('=').collect();
    let [raw_key, raw_value] = parts.as_slice() else {
        return Err(AutomationError::BuiltinError(format!(
            "The value provided is malformed: {}, syntax is 'key=value' (only one =)",
            line
        )));
    };

    resolve_update(raw_key, raw_value, environment).map_err(|e| {
        AutomationError::BuiltinError(format!(
            "Impossible to update the inventory attribute: {} - {} - Last Error was: {}. If error is related to environment, retry adding parameter: -e {}=\"${{ENVVAR}} | $ENVAR\"",
            raw_key, raw_value, e, raw_value
        ))
    })
}

fn resolve_update(
    raw_key: &str,
    raw_value: &str,
    environment: &Environment,
) -> Result<(String, String)> {
    let key = remove_quotes(&env_subst_strict(raw_key.trim(), environment)?);
    let items: Vec<&str> = raw_value.trim().split('.').collect();

    let variable = items.iter().position(|item| has_variable(item));
    let value = match variable {
        Some(index) => {
            let resolved = env_subst_strict(items[index], environment)?;
            let path: Vec<&str> = items
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, item)| *item)
                .collect();
            if path.is_empty() {
                remove_quotes(&resolved)
            } else {
                let path = path.join(".");
                let json: Value = serde_json::from_str(&resolved).map_err(|_| {
                    AutomationError::EnvironmentError(format!(
                        "You're asking to extract key {} from a string which not formated as JSON: {}",
                        path, resolved
                    ))
                })?;
                get_nested(&json, &path)
                    .map(|v| remove_quotes(&value_to_plain_string(v)))
                    .unwrap_or_default()
            }
        }
        // 没有变量时按字面值写入，例如 IP 地址
        None => remove_quotes(raw_value.trim()),
    };

    if value.is_empty() {
        return Err(AutomationError::EnvironmentError(format!(
            "The value resolved for {} is empty",
            key
        )));
    }
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_and_value_substitution() {
        let environment = env(&[("HOST", "web1"), ("IP", "10.0.0.5")]);
        let (key, value) = parse_update("hosts.$HOST.ip=$IP", &environment).unwrap();
        assert_eq!(key, "hosts.web1.ip");
        assert_eq!(value, "10.0.0.5");
    }

    #[test]
    fn test_value_extracted_from_json_variable() {
        let environment = env(&[("CREDS", r#"{"login":"admin","password":"s3cret"}"#)]);
        let (key, value) = parse_update("db.password=$CREDS.password", &environment).unwrap();
        assert_eq!(key, "db.password");
        assert_eq!(value, "s3cret");
    }

    #[test]
    fn test_literal_dotted_value() {
        let (_, value) = parse_update("gateway=192.168.1.1", &Environment::new()).unwrap();
        assert_eq!(value, "192.168.1.1");
    }

    #[test]
    fn test_malformed_line() {
        let err = parse_update("a=b=c", &Environment::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Builtin operation failed: The value provided is malformed: a=b=c, syntax is 'key=value' (only one =)"
        );
    }

    #[test]
    fn test_missing_variable_is_reported() {
        let err = parse_update("a=$MISSING", &Environment::new()).unwrap_err();
        assert!(err.to_string().contains("MISSING was not found in the provided environment"));
    }

    #[test]
    fn test_non_json_extraction_fails() {
        let environment = env(&[("V", "plain")]);
        assert!(parse_update("a=$V.key", &environment).is_err());
    }
}
