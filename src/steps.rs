//! 编排器对每台主机、每个操作依次调用的步骤

use crate::context::RunContext;
use crate::env::{env_subst, remove_quotes, Environment};
use crate::inventory::{is_inventory_key, Inventory};
use crate::shell::ShellBuilder;
use crate::types::{Host, Operation, OutputKind, ShellDescription, ShellOutput};
use crate::when::is_when_condition_match;
use crate::Result;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// 以 `#[C]` 开头的行是变更明细，不显示也不进入 register
static CHANGE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\[C\]").expect("valid regex"));
static CHANGE_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\[C\]\[.*\]:(\d*)").expect("valid regex"));
static SUDO_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[sudo\] password for .*:").expect("valid regex"));

pub const MESSAGE_EXIT_WITH_OUTPUT_ON_STDERR: &str = "\n[WARN] This operation ended with the exitCode: 0, but some messages were redirected to the 'stderr' output.\n
This may be due to :
- the program sending warning informations on the 'stderr' output
- OR a programming error
- OR your system's inability to distinguish between stderr and stdout output.
You can try to resolve the issue by detecting the command in question and following it up with:
\"2>/dev/null\" if you don't want to display error
or
\"2>&1\" to redirect error to stdout

Check the log file for '**shellStdErr**:'
";

const NOLOG_NOTICE: &str = "[Security] Events received for this operation (stdout & stderr) will NOT be logged (attribute \"nolog\" detected for this operation).";

/// 主机在一个操作上的终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    Skipped,
    Succeeded,
    Failed,
}

/// `(n/total)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}/{})", self.current, self.total)
    }
}

fn console(ctx: &RunContext, text: &str) {
    if !ctx.flags.silent {
        ctx.spinner.println(text);
    }
}

fn console_err(ctx: &RunContext, text: &str) {
    if !text.is_empty() {
        ctx.spinner.eprintln(text);
    }
}

fn announce_start(ctx: &RunContext, operation: &Operation, host: &Host, progress: Progress) {
    if !ctx.flags.silent && !ctx.flags.quiet {
        ctx.spinner.println(&format!(
            "--> Starting Operations: \"{}\" on: {} {}\n",
            operation.name, host.user_input, progress
        ));
    }
}

/// limitHosts 中的项先做环境替换，再与 user_input 或 to_perform 比较
pub fn is_operation_allowed_on_host(
    operation: &Operation,
    host: &Host,
    environment: &Environment,
) -> bool {
    let Some(limit_hosts) = operation.limit_hosts.as_ref().filter(|l| !l.is_empty()) else {
        return true;
    };
    limit_hosts
        .iter()
        .map(|limit| env_subst(limit, environment))
        .any(|limit| limit == host.user_input || limit == host.to_perform)
}

pub fn step_limit_hosts(
    ctx: &RunContext,
    operation: &Operation,
    host: &Host,
    environment: &Environment,
) -> bool {
    if is_operation_allowed_on_host(operation, host, environment) {
        return true;
    }
    let message = format!(
        "The operation: \"{}\" contains 'limitHosts' list: {:?}.\nOperation could not be performed on Host {}/{}\n",
        operation.name,
        operation.limit_hosts.clone().unwrap_or_default(),
        host.user_input,
        host.to_perform
    );
    debug!("{}", message);
    console(ctx, &message);
    false
}

/// `when` 不满足时宣告跳过并返回 false
pub fn step_when_condition(
    ctx: &RunContext,
    operation: &Operation,
    host: &Host,
    environment: &Environment,
    inventory: Option<&Inventory>,
    progress: Progress,
) -> bool {
    let Some(condition) = operation.when.as_deref() else {
        return true;
    };
    debug!("when detected on operation {}: {}", operation.name, condition);
    if is_when_condition_match(condition, environment, inventory) {
        return true;
    }

    let message = format!(
        "[WARN] This operation is subject to the following conditions: {}. As the condition is not met, so this operation is not executed.",
        condition
    );
    ctx.logger.host_event(&host.user_input, &message);
    announce_start(ctx, operation, host, progress);
    console(ctx, &message);
    console(
        ctx,
        &format!(
            "\n<-- Operation canceled by condition [{}: 0 ms] {}\n",
            host.user_input, progress
        ),
    );
    false
}

/// 环境和 copyTo 中的 `#inv.` 引用替换为清单值；必需变量为空时返回错误
pub fn step_interpolate_inventory(
    ctx: &RunContext,
    operation: &mut Operation,
    inventory: &Inventory,
    host: &Host,
) -> std::result::Result<(), String> {
    let mut extended: Environment = std::env::vars().collect();
    extended.extend(
        operation
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let keys: Vec<String> = operation.environment.keys().cloned().collect();
    for key in keys {
        let raw = remove_quotes(operation.environment.get(&key).map(String::as_str).unwrap_or_default());
        if !is_inventory_key(&raw) {
            continue;
        }
        let from_inventory = inventory.resolve_attribute_value(&raw, &extended);
        let resolved = if from_inventory.is_empty() {
            from_inventory
        } else {
            env_subst(&from_inventory, &extended)
        };
        debug!("interpolateInventoryValues: {} => '{}'", key, resolved);

        if resolved.is_empty() {
            if operation.is_required(&key) {
                let messages = [
                    format!("in operation: {}", operation.name),
                    format!("        Unable to substitute: {}", raw),
                    format!(
                        "You need to check your inventory file: {}, this path is not found in the yaml structure OR value is empty",
                        inventory.path().display()
                    ),
                ];
                for message in &messages {
                    console_err(ctx, &format!("[ERROR] {}", message));
                    ctx.logger.host_event(&host.user_input, message);
                }
                return Err(format!("Unable to substitute: {}", raw));
            }
            debug!("{} is not required and not found, new value is empty", key);
        }
        operation.environment.insert(key, resolved);
    }

    for item in operation.copy_to.iter_mut().flatten() {
        for field in [&mut item.src, &mut item.dest] {
            let raw = remove_quotes(field);
            let from_inventory = if is_inventory_key(&raw) {
                inventory.resolve_attribute_value(&raw, &extended)
            } else {
                String::new()
            };
            *field = if from_inventory.is_empty() {
                env_subst(&raw, &extended)
            } else {
                from_inventory
            };
        }
    }
    Ok(())
}

/// 内置操作返回占位描述
pub fn step_build_shell(
    builder: &ShellBuilder,
    operation: &Operation,
    host: &Host,
) -> Result<Option<ShellDescription>> {
    if operation.has_scripts() || operation.command.is_some() {
        return builder.build_shell(operation, &host.user_input).map(Some);
    }
    if operation.is_builtin() {
        return Ok(Some(ShellDescription {
            shell_instructions: "builtin".to_string(),
            ..Default::default()
        }));
    }
    Ok(None)
}

/// 一台主机在一个操作上收到的输出
#[derive(Debug, Default)]
pub struct OutputCollector {
    pub lines: Vec<ShellOutput>,
    security_notice_shown: bool,
}

pub fn step_data(
    ctx: &RunContext,
    operation: &Operation,
    host: &Host,
    line: ShellOutput,
    collector: &mut OutputCollector,
) {
    ctx.activity.touch();
    if !operation.nolog || ctx.flags.nolog {
        let tag = match line.output {
            OutputKind::Stdout => "shellStdOut",
            OutputKind::Stderr => "**shellStdErr**",
        };
        ctx.logger
            .host_event(&host.user_input, &format!("{}: {}", tag, line.message));
    } else if !collector.security_notice_shown {
        console(ctx, NOLOG_NOTICE);
        collector.security_notice_shown = true;
    }

    let text = line.message.trim();
    ctx.spinner.set_text(&format!(
        "{}: {}",
        host.user_input,
        if text.is_empty() { "Waiting for message..." } else { text }
    ));
    collector.lines.push(line);
}

/// 传输层错误转成结束事件的错误信息
pub fn step_error(ctx: &RunContext, host: &Host, message: &str) -> String {
    ctx.activity.touch();
    debug!("transport error on {}: {}", host.user_input, message);
    ctx.logger.host_event(
        &host.user_input,
        &format!("[ERROR] End of process execution: {}\n", message),
    );
    message.to_string()
}

/// `#[C][...]:<n>` 行中的变更数
pub fn changes_in_line(message: &str) -> Option<i64> {
    CHANGE_TOTAL
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

/// register 的内容：`name` 只取 stdout，`name:json` 为 `{"stdout":..,"stderr":..}`
pub fn register_content(register: &str, lines: &[ShellOutput]) -> Option<(String, String)> {
    let mut parts = register.split(':');
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() {
        return None;
    }
    let format = parts.next().map(str::trim);

    let collect = |kind: OutputKind| -> String {
        lines
            .iter()
            .filter(|l| l.output == kind && !l.message.trim().is_empty())
            .filter(|l| kind == OutputKind::Stderr || !CHANGE_LINE.is_match(&l.message))
            .map(|l| l.message.trim())
            .collect::<Vec<_>>()
            .join("\n")
    };
    let stdout = collect(OutputKind::Stdout);

    let content = if format == Some("json") {
        let stderr = collect(OutputKind::Stderr);
        let as_json = |text: String| serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        serde_json::json!({ "stdout": as_json(stdout), "stderr": as_json(stderr) }).to_string()
    } else {
        stdout
    };
    debug!("registerContentToEnvironment: '{}'='{}'", name, content);
    Some((name.to_string(), content))
}

/// 结束事件：注册变量、输出缓冲、统计变更、记录失败
#[allow(clippy::too_many_arguments)]
pub fn step_end(
    ctx: &RunContext,
    operation: &Operation,
    host: &Host,
    error: Option<&str>,
    elapsed: Duration,
    shell: &ShellDescription,
    progress: Progress,
    collector: &OutputCollector,
) -> HostOutcome {
    ctx.activity.touch();
    let elapsed_ms = elapsed.as_millis();
    ctx.logger.host_event(
        &host.user_input,
        &format!("Shell execution completed in {} ms", elapsed_ms),
    );
    announce_start(ctx, operation, host, progress);

    if error.is_none() {
        if let Some((name, content)) = operation
            .register
            .as_deref()
            .and_then(|register| register_content(register, &collector.lines))
        {
            ctx.register(&name, content);
        }
    }

    let show_stdout = !ctx.flags.silent && !(operation.register.is_some() && ctx.flags.quiet);
    let mut has_stderr = false;
    for line in &collector.lines {
        match line.output {
            OutputKind::Stdout => {
                if show_stdout {
                    if !CHANGE_LINE.is_match(&line.message) && !SUDO_PROMPT.is_match(&line.message) {
                        ctx.spinner.println(&line.message);
                    }
                    if CHANGE_TOTAL.is_match(&line.message) {
                        ctx.spinner.println(&format!("\n{}", line.message));
                    }
                }
                if let Some(count) = changes_in_line(&line.message) {
                    ctx.add_changes(&host.user_input, count);
                }
            }
            OutputKind::Stderr => {
                has_stderr = true;
                console_err(ctx, &line.message);
            }
        }
    }

    match error {
        Some(message) => {
            console_err(ctx, message);
            let log_path = ctx
                .logger
                .host_log_path(&host.user_input)
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            console_err(
                ctx,
                &format!(
                    "\n<-- Operation failed [{}: {} ms/{}ms - {} {}\n",
                    host.user_input, elapsed_ms, shell.time_to_build_ms, log_path, progress
                ),
            );
            ctx.logger
                .host_event(&host.user_input, &format!("[ERROR] {}", message));
            ctx.record_failure(&host.user_input, &operation.name);
            HostOutcome::Failed
        }
        None => {
            if has_stderr && !ctx.flags.silent {
                ctx.spinner.eprintln(MESSAGE_EXIT_WITH_OUTPUT_ON_STDERR);
            }
            if !ctx.flags.silent && !ctx.flags.quiet {
                ctx.spinner.println(&format!(
                    "\n<-- Operation succeeded [{}: {} ms/ {} ms] {}\n",
                    host.user_input, elapsed_ms, shell.time_to_build_ms, progress
                ));
            }
            HostOutcome::Succeeded
        }
    }
}

/// 传输尚未开始就失败：记录并让主机退出后续操作
pub fn step_start_failed(
    ctx: &RunContext,
    operation: &Operation,
    host: &Host,
    message: &str,
) -> HostOutcome {
    console_err(ctx, &format!("[ERROR] {}", message));
    ctx.logger
        .host_event(&host.user_input, &format!("[ERROR] {}", message));
    ctx.record_failure(&host.user_input, &operation.name);
    HostOutcome::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunFlags;
    use crate::log::RunLogger;

    fn ctx() -> RunContext {
        RunContext::new(RunFlags::silent(), RunLogger::disabled())
    }

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_limit_hosts_matching() {
        let op = Operation::command("a", "ls").limit_to(vec!["hostA".to_string(), "$OTHER".to_string()]);
        let environment = env(&[("OTHER", "10.0.0.9")]);
        assert!(is_operation_allowed_on_host(&op, &Host::new("hostA", "10.0.0.1"), &environment));
        assert!(is_operation_allowed_on_host(&op, &Host::new("x", "10.0.0.9"), &environment));
        assert!(!is_operation_allowed_on_host(&op, &Host::new("hostB", "10.0.0.2"), &environment));
        let open = Operation::command("b", "ls");
        assert!(is_operation_allowed_on_host(&open, &Host::new("hostB", "10.0.0.2"), &environment));
    }

    #[test]
    fn test_register_raw_and_json() {
        let lines = vec![
            ShellOutput::stdout("  value  "),
            ShellOutput::stdout("#[C][pkg]:1"),
            ShellOutput::stdout(""),
            ShellOutput::stderr("warning"),
        ];
        assert_eq!(
            register_content("OUT", &lines),
            Some(("OUT".to_string(), "value".to_string()))
        );

        let json_lines = vec![ShellOutput::stdout(r#"{"a":1}"#)];
        let (name, content) = register_content("DATA:json", &json_lines).unwrap();
        assert_eq!(name, "DATA");
        let parsed: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["stdout"]["a"], 1);
        assert_eq!(parsed["stderr"], "");

        assert_eq!(register_content(" ", &lines), None);
    }

    #[test]
    fn test_changes_in_line() {
        assert_eq!(changes_in_line("#[C][Total changes]:3"), Some(3));
        assert_eq!(changes_in_line("#[C] detail"), None);
        assert_eq!(changes_in_line("plain"), None);
    }

    #[test]
    fn test_step_end_records_failure_and_changes() {
        let ctx = ctx();
        let op = Operation::command("deploy", "x").register_as("R");
        let host = Host::new("h1", "10.0.0.1");
        let mut collector = OutputCollector::default();
        step_data(&ctx, &op, &host, ShellOutput::stdout("#[C][Total]:2"), &mut collector);
        step_data(&ctx, &op, &host, ShellOutput::stdout("done"), &mut collector);

        let progress = Progress { current: 1, total: 1 };
        let shell = ShellDescription::default();
        let outcome = step_end(&ctx, &op, &host, None, Duration::ZERO, &shell, progress, &collector);
        assert_eq!(outcome, HostOutcome::Succeeded);
        assert_eq!(ctx.changes_for("h1"), 2);
        assert_eq!(ctx.registered().get("R").map(String::as_str), Some("done"));

        let outcome = step_end(
            &ctx,
            &Operation::command("broken", "x").register_as("S"),
            &host,
            Some("bash exiting with code: 1"),
            Duration::ZERO,
            &shell,
            progress,
            &collector,
        );
        assert_eq!(outcome, HostOutcome::Failed);
        assert!(!ctx.registered().contains_key("S"));
        assert_eq!(ctx.failures()[0].operation_error.as_deref(), Some("broken"));
    }

    #[test]
    fn test_when_gating() {
        let ctx = ctx();
        let op = Operation::command("a", "ls").when("$V==1");
        let host = Host::new("h", "10.0.0.1");
        let progress = Progress { current: 1, total: 1 };
        assert!(step_when_condition(&ctx, &op, &host, &env(&[("V", "1")]), None, progress));
        assert!(!step_when_condition(&ctx, &op, &host, &env(&[("V", "2")]), None, progress));
        assert!(!step_when_condition(&ctx, &op, &host, &Environment::new(), None, progress));
    }

    #[test]
    fn test_builtin_placeholder_shell() {
        let builder = ShellBuilder::new().unwrap();
        let op = Operation::builtin("b", "#isCidrNetwork", vec![]);
        let shell = step_build_shell(&builder, &op, &Host::new("h", "1.2.3.4")).unwrap();
        assert_eq!(shell.unwrap().shell_instructions, "builtin");
        let empty = Operation::default();
        assert!(step_build_shell(&builder, &empty, &Host::new("h", "1.2.3.4")).unwrap().is_none());
    }
}
