//! 按顺序执行操作，同一操作内各主机并发
use crate::config::ExecOptions;
use crate::context::RunContext;
use crate::env::Environment;
use crate::error::AutomationError;
use crate::report::{ReportCollector, RunReport};
use crate::shell::ShellBuilder;
use crate::steps::{
    step_build_shell, step_data, step_end, step_error, step_interpolate_inventory,
    step_limit_hosts, step_start_failed, step_when_condition, HostOutcome, OutputCollector,
    Progress,
};
use crate::transport::{
    ConnectionEvent, DefaultTransportSelector, TransportJob, TransportSelector,
};
use crate::types::{Host, Operation};
use crate::utils::remove_file_quietly;
use crate::Result;
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CANCELED: i32 = 2;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// 一次运行的结果
#[derive(Debug)]
pub struct RunSummary {
    pub exit_code: i32,
    /// 被中断时没有报告
    pub report: Option<RunReport>,
}

/// 读取 YAML 操作列表，相对脚本路径以该文件所在目录为基准
pub fn load_operations<P: AsRef<Path>>(path: P) -> Result<Vec<Operation>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        AutomationError::FileOperationError(format!(
            "Failed to read operations file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut operations: Vec<Operation> = serde_yaml::from_str(&content).map_err(|e| {
        AutomationError::ValidationError(format!(
            "Operations file {} is not a valid list of operations: {}",
            path.display(),
            e
        ))
    })?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for operation in operations.iter_mut() {
        for script in operation.scripts.iter_mut().flatten() {
            if Path::new(script.as_str()).is_relative() {
                *script = base.join(script.as_str()).display().to_string();
            }
        }
    }
    info!("{} operations loaded from {}", operations.len(), path.display());
    Ok(operations)
}

pub struct OperationRunner {
    ctx: Arc<RunContext>,
    options: Arc<ExecOptions>,
    selector: Arc<dyn TransportSelector>,
    shell_builder: Arc<ShellBuilder>,
    /// None 时同一操作的所有主机同时执行
    max_concurrent_hosts: Option<usize>,
}

impl OperationRunner {
    pub fn new(ctx: Arc<RunContext>, options: Arc<ExecOptions>) -> Result<Self> {
        Ok(Self {
            ctx,
            options,
            selector: Arc::new(DefaultTransportSelector::default()),
            shell_builder: Arc::new(ShellBuilder::new()?),
            max_concurrent_hosts: None,
        })
    }

    /// 替换传输选择器
    pub fn with_selector(mut self, selector: Arc<dyn TransportSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// 设置最大并发主机数
    pub fn with_max_concurrent_hosts(mut self, max_hosts: usize) -> Self {
        self.max_concurrent_hosts = Some(max_hosts.max(1));
        self
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// 执行全部操作并给出退出码；Ctrl-C 或长时间无活动会直接中断
    pub async fn run(&self, operations: &[Operation], hosts: &[Host]) -> RunSummary {
        let started = Instant::now();
        self.ctx.activity.touch();
        let timeout = self.options.activity_timeout();

        let outcome = tokio::select! {
            result = self.run_operations(operations, hosts) => result,
            _ = tokio::signal::ctrl_c() => {
                self.ctx.spinner.stop();
                self.ctx.spinner.eprintln("\nProcess Canceled by user");
                warn!("run interrupted by the operator");
                return RunSummary { exit_code: EXIT_CANCELED, report: None };
            }
            _ = self.ctx.activity.watchdog(timeout, WATCHDOG_INTERVAL) => {
                self.ctx.spinner.stop();
                let message = format!(
                    "[ERROR] No activity for {} minutes, the run is aborted",
                    self.options.activity_timeout_minutes
                );
                self.ctx.spinner.eprintln(&message);
                error!("{}", message);
                return RunSummary { exit_code: EXIT_CANCELED, report: None };
            }
        };
        self.ctx.spinner.stop();

        let mut exit_code = EXIT_SUCCESS;
        if let Err(e) = outcome {
            error!("run aborted: {}", e);
            self.ctx.spinner.eprintln(&format!("[ERROR] {}", e));
            exit_code = EXIT_FAILURE;
        }

        let report = ReportCollector::collect(hosts, &self.ctx, started.elapsed());
        if let Err(e) = ReportCollector::print(&report, &self.ctx, self.options.json_report) {
            warn!("Unable to print the report: {}", e);
        }

        if self.ctx.is_canceled() {
            self.ctx.spinner.eprintln(&AutomationError::CanceledByUser.to_string());
            exit_code = EXIT_CANCELED;
        } else if !self.ctx.failures().is_empty() {
            exit_code = EXIT_FAILURE;
        }
        info!("run finished in {} ms (exit code {})", report.elapsed_ms, exit_code);
        RunSummary {
            exit_code,
            report: Some(report),
        }
    }

    /// 逐个操作执行；失败的主机不再参与后续操作
    pub async fn run_operations(&self, operations: &[Operation], hosts: &[Host]) -> Result<()> {
        let mut active: Vec<Host> = hosts.to_vec();
        let total = operations.len();

        for (index, operation) in operations.iter().enumerate() {
            if active.is_empty() {
                info!("No host left, remaining operations are not executed");
                break;
            }
            if self.ctx.is_canceled() {
                break;
            }
            let progress = Progress {
                current: index + 1,
                total,
            };
            info!("Executing operation: {} on {} hosts", operation.name, active.len());
            self.ctx.logger.debug_event(&format!(
                "operation {} {}: active hosts {:?}",
                operation.name,
                progress,
                active.iter().map(|h| h.user_input.as_str()).collect::<Vec<_>>()
            ));

            let environment = operation.environment.clone();
            let permits = self.max_concurrent_hosts.unwrap_or(active.len()).max(1);
            let semaphore = Arc::new(Semaphore::new(permits));
            let pending = active.iter().map(|host| {
                let semaphore = semaphore.clone();
                let environment = &environment;
                async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|e| {
                        AutomationError::InternalError(format!("Host scheduler closed: {}", e))
                    })?;
                    self.run_on_host(operation, environment, host, progress).await
                }
            });
            // 全部主机到达终态后才进入下一个操作
            let outcomes = join_all(pending).await;

            let mut still_active = Vec::with_capacity(active.len());
            for (host, outcome) in active.into_iter().zip(outcomes) {
                match outcome? {
                    HostOutcome::Failed => {
                        warn!("Host {} failed on operation {}, skipping it from now on", host.user_input, operation.name);
                    }
                    HostOutcome::Skipped | HostOutcome::Succeeded => still_active.push(host),
                }
            }
            active = still_active;
            self.ctx.activity.touch();
        }
        Ok(())
    }

    /// 一台主机上的一个操作；只有内部错误会返回 Err
    async fn run_on_host(
        &self,
        template: &Operation,
        snapshot: &Environment,
        host: &Host,
        progress: Progress,
    ) -> Result<HostOutcome> {
        let mut operation = template.clone();
        let mut environment = snapshot.clone();
        environment.extend(self.ctx.registered());

        if !step_limit_hosts(&self.ctx, &operation, host, &environment) {
            return Ok(HostOutcome::Skipped);
        }
        environment.insert("host".to_string(), host.user_input.clone());

        let inventory = match self.ctx.inventory_snapshot() {
            Ok(inventory) => inventory,
            Err(e) => {
                return Ok(step_start_failed(&self.ctx, &operation, host, &e.to_string()));
            }
        };
        if !step_when_condition(
            &self.ctx,
            &operation,
            host,
            &environment,
            inventory.as_deref(),
            progress,
        ) {
            return Ok(HostOutcome::Skipped);
        }

        operation.environment = environment;
        if let Some(inventory) = inventory.as_deref() {
            if let Err(message) =
                step_interpolate_inventory(&self.ctx, &mut operation, inventory, host)
            {
                debug!("inventory interpolation failed on {}: {}", host.user_input, message);
                self.ctx.record_failure(&host.user_input, &operation.name);
                return Ok(HostOutcome::Failed);
            }
        }

        let shell = match step_build_shell(&self.shell_builder, &operation, host) {
            Ok(Some(shell)) => shell,
            Ok(None) => {
                debug!("nothing to execute for {} on {}", operation.name, host.user_input);
                return Ok(HostOutcome::Skipped);
            }
            Err(e @ AutomationError::InternalError(_)) => return Err(e),
            Err(e) => return Ok(step_start_failed(&self.ctx, &operation, host, &e.to_string())),
        };

        let transport = self.selector.select(&operation, host);
        debug!(
            "starting {} on {} with {:?} transport",
            operation.name,
            host.user_input,
            transport.kind()
        );
        let job = TransportJob {
            shell: shell.clone(),
            host: host.clone(),
            operation: operation.clone(),
            options: self.options.clone(),
            ctx: self.ctx.clone(),
        };

        let started = Instant::now();
        let mut adapter = match transport.start(job).await {
            Ok(adapter) => adapter,
            Err(e) => {
                if let Some(tmp_file) = shell.tmp_file.as_deref() {
                    remove_file_quietly(tmp_file);
                }
                let message = self.options.hide_secrets(&e.to_string());
                return Ok(step_start_failed(&self.ctx, &operation, host, &message));
            }
        };

        let mut collector = OutputCollector::default();
        let end_error = loop {
            match adapter.next_event().await {
                Some(ConnectionEvent::Data(line)) => {
                    step_data(&self.ctx, &operation, host, line, &mut collector);
                }
                Some(ConnectionEvent::Error(message)) => {
                    break Some(step_error(&self.ctx, host, &message));
                }
                Some(ConnectionEvent::End(error)) => break error,
                None => {
                    break Some(step_error(
                        &self.ctx,
                        host,
                        "connection closed without an end event",
                    ));
                }
            }
        };
        drop(adapter);

        let outcome = step_end(
            &self.ctx,
            &operation,
            host,
            end_error.as_deref(),
            started.elapsed(),
            &shell,
            progress,
            &collector,
        );
        if let Some(tmp_file) = shell.tmp_file.as_deref() {
            remove_file_quietly(tmp_file);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_operations_resolves_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ops.yaml");
        std::fs::write(
            &file,
            "- name: install\n  scripts: [install.sh, /opt/abs.sh]\n  limitHosts: [web]\n- name: check\n  command: uptime\n  environment:\n    RETRIES: 3\n",
        )
        .unwrap();

        let operations = load_operations(&file).unwrap();
        assert_eq!(operations.len(), 2);
        let scripts = operations[0].scripts.clone().unwrap();
        assert_eq!(scripts[0], dir.path().join("install.sh").display().to_string());
        assert_eq!(scripts[1], "/opt/abs.sh");
        assert_eq!(operations[0].limit_hosts, Some(vec!["web".to_string()]));
        assert_eq!(
            operations[1].environment.get("RETRIES").map(String::as_str),
            Some("3")
        );
    }

    #[test]
    fn test_load_operations_rejects_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ops.yaml");
        std::fs::write(&file, "name: not-a-list\n").unwrap();
        assert!(matches!(
            load_operations(&file),
            Err(AutomationError::ValidationError(_))
        ));
        assert!(load_operations(dir.path().join("missing.yaml")).is_err());
    }
}
