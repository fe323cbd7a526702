//! 环境变量替换与嵌套取值工具

use crate::error::AutomationError;
use crate::Result;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub type Environment = BTreeMap<String, String>;

static BASH_VARIABLE_EXTENDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("valid regex"));
static BASH_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z0-9_]+)").expect("valid regex"));

/// 只有首尾引号相同时才去掉外层引号
pub fn remove_quotes(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' || first == b'\'') && first == last {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// 是否包含 `$VAR` 或 `${VAR}` 引用
pub fn has_variable(value: &str) -> bool {
    BASH_VARIABLE.is_match(value) || BASH_VARIABLE_EXTENDED.is_match(value)
}

/// 替换 `${VAR}` 与 `$VAR`，未解析的引用原样保留
pub fn env_subst(template: &str, environment: &Environment) -> String {
    substitute(template, environment, false).unwrap_or_else(|_| template.to_string())
}

/// 同 [`env_subst`]，但任何未解析的引用都返回错误
pub fn env_subst_strict(template: &str, environment: &Environment) -> Result<String> {
    substitute(template, environment, true)
}

fn substitute(template: &str, environment: &Environment, strict: bool) -> Result<String> {
    let mut missing: Option<String> = None;
    let mut replace = |caps: &Captures, extended: bool| -> String {
        let key = &caps[1];
        match environment.get(key) {
            Some(value) => remove_quotes(value),
            None => {
                if strict && missing.is_none() {
                    missing = Some(key.to_string());
                }
                if extended {
                    format!("${{{}}}", key)
                } else {
                    format!("${}", key)
                }
            }
        }
    };

    let form1 = BASH_VARIABLE_EXTENDED
        .replace_all(template, |caps: &Captures| replace(caps, true))
        .into_owned();
    let form2 = BASH_VARIABLE
        .replace_all(&form1, |caps: &Captures| replace(caps, false))
        .into_owned();

    match missing {
        Some(key) => Err(AutomationError::EnvironmentError(format!(
            "{} was not found in the provided environment",
            key
        ))),
        None => Ok(form2),
    }
}

/// 按 `a.b[0].c` 路径取值
pub fn get_nested<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split(['.', '[', ']'])
        .filter(|key| !key.is_empty())
        .try_fold(value, |acc, key| match acc {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// 按点分路径写值，中间层不存在时创建
pub fn set_nested(target: &mut Value, path: &str, new_value: Value) {
    let keys: Vec<&str> = path.split('.').filter(|k| !k.is_empty()).collect();
    let Some((last, parents)) = keys.split_last() else {
        return;
    };

    let mut current = target;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        let Value::Object(map) = current else {
            return;
        };
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        current = entry;
    }

    if !current.is_object() {
        *current = Value::Object(Default::default());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), new_value);
    }
}

/// 标量直接输出，对象和数组输出 JSON
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 解析形如 `{"password":"x","login":"y"}.password` 的值
pub fn try_parse_as_json(resolved: &str) -> String {
    if !resolved.starts_with('{') {
        return resolved.to_string();
    }
    let Some(end) = resolved.rfind('}') else {
        return resolved.to_string();
    };
    let rest = resolved[end + 1..].trim();
    if rest.is_empty() {
        return resolved.to_string();
    }
    match serde_json::from_str::<Value>(&resolved[..=end]) {
        Ok(json) => get_nested(&json, rest)
            .map(value_to_plain_string)
            .unwrap_or_default(),
        Err(_) => resolved.to_string(),
    }
}

/// 解析命令行 `-e KEY=value`，值不能为空
pub fn parse_env_assignments(assignments: &[String]) -> Result<Environment> {
    let mut environment = Environment::new();
    for assignment in assignments {
        match assignment.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.is_empty() => {
                environment.insert(key.trim().to_string(), value.to_string());
            }
            _ => {
                return Err(AutomationError::ValidationError(format!(
                    "Malformed environment variable: '{}', syntax is KEY=value",
                    assignment
                )));
            }
        }
    }
    Ok(environment)
}

/// 在 SSH 命令前缀 `KEY="value"`，双引号转义
pub fn bash_parameters(environment: &Environment) -> String {
    environment
        .iter()
        .map(|(key, value)| {
            let value = remove_quotes(value).replace('"', "\\\"");
            format!("{}=\"{}\" ", key, value)
        })
        .collect()
}

/// 子进程环境：进程环境加上操作环境（去掉外层引号）
pub fn process_environment(operation_env: &Environment) -> Environment {
    let mut merged: Environment = std::env::vars().collect();
    for (key, value) in operation_env {
        merged.insert(key.clone(), remove_quotes(value).replace("\\\"", "\""));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_subst_both_forms() {
        let e = env(&[("NAME", "\"world\""), ("N", "2")]);
        assert_eq!(env_subst("hello ${NAME} $N", &e), "hello world 2");
    }

    #[test]
    fn test_env_subst_keeps_unresolved() {
        let e = env(&[]);
        assert_eq!(env_subst("$V==1", &e), "$V==1");
        assert_eq!(env_subst("${V}", &e), "${V}");
    }

    #[test]
    fn test_env_subst_strict_fails_on_unresolved() {
        let e = env(&[("A", "1")]);
        assert_eq!(env_subst_strict("$A", &e).unwrap(), "1");
        let err = env_subst_strict("$A-$B", &e).unwrap_err();
        assert!(err.to_string().contains("B was not found"));
    }

    #[test]
    fn test_remove_quotes() {
        assert_eq!(remove_quotes("\"abc\""), "abc");
        assert_eq!(remove_quotes("'abc'"), "abc");
        assert_eq!(remove_quotes("\"abc'"), "\"abc'");
        assert_eq!(remove_quotes("\""), "\"");
    }

    #[test]
    fn test_nested_get_and_set() {
        let mut doc = json!({"a": {"list": [{"b": "x"}]}});
        assert_eq!(get_nested(&doc, "a.list[0].b"), Some(&json!("x")));
        assert_eq!(get_nested(&doc, "a.missing"), None);

        set_nested(&mut doc, "c.d.e", json!("new"));
        assert_eq!(get_nested(&doc, "c.d.e"), Some(&json!("new")));
        set_nested(&mut doc, "a.list", json!(1));
        assert_eq!(get_nested(&doc, "a.list"), Some(&json!(1)));
    }

    #[test]
    fn test_try_parse_as_json() {
        let v = r#"{"password":"p","login":"l"}.login"#;
        assert_eq!(try_parse_as_json(v), "l");
        assert_eq!(try_parse_as_json("plain"), "plain");
        assert_eq!(try_parse_as_json("{not json}.a"), "{not json}.a");
    }

    #[test]
    fn test_parse_env_assignments() {
        let parsed =
            parse_env_assignments(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(parsed.get("A").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("B").map(String::as_str), Some("x=y"));
        assert!(parse_env_assignments(&["A=".to_string()]).is_err());
        assert!(parse_env_assignments(&["A".to_string()]).is_err());
    }

    #[test]
    fn test_bash_parameters_escape_quotes() {
        let e = env(&[("A", "say \"hi\""), ("B", "\"quoted\"")]);
        assert_eq!(bash_parameters(&e), "A=\"say \\\"hi\\\"\" B=\"quoted\" ");
    }
}
