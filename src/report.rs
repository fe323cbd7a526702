use crate::context::RunContext;
use crate::error::AutomationError;
use crate::types::Host;
use crate::Result;
use serde::Serialize;
use std::time::Duration;

/// 报告中一台主机的结果
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostReport {
    pub host: String,
    pub target: String,
    pub result: String,
    pub failed_operation: Option<String>,
    pub log_file: Option<String>,
    pub changes: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub hosts: Vec<HostReport>,
    pub elapsed_ms: u128,
}

pub struct ReportCollector;

impl ReportCollector {
    /// 每台主机取第一条失败记录
    pub fn collect(hosts: &[Host], ctx: &RunContext, elapsed: Duration) -> RunReport {
        let failures = ctx.failures();
        let rows = hosts
            .iter()
            .map(|host| {
                let failed_operation = failures
                    .iter()
                    .find(|f| f.host == host.user_input)
                    .and_then(|f| f.operation_error.clone());
                let result = match failed_operation.as_deref() {
                    Some(operation) => format!("ERROR in operation: \"{}\"", operation),
                    None => "OK".to_string(),
                };
                HostReport {
                    host: host.user_input.clone(),
                    target: host.to_perform.clone(),
                    result,
                    failed_operation,
                    log_file: ctx
                        .logger
                        .host_log_path(&host.user_input)
                        .map(|p| p.display().to_string()),
                    changes: ctx.changes_for(&host.user_input),
                }
            })
            .collect();
        RunReport {
            hosts: rows,
            elapsed_ms: elapsed.as_millis(),
        }
    }

    pub fn render_json(report: &RunReport) -> Result<String> {
        serde_json::to_string_pretty(report).map_err(|e| {
            AutomationError::InternalError(format!("Failed to serialize report: {}", e))
        })
    }

    pub fn render_table(report: &RunReport) -> String {
        let host_cells: Vec<String> = report
            .hosts
            .iter()
            .map(|r| format!("{}-{}", r.host, r.target))
            .collect();
        let result_cells: Vec<String> = report
            .hosts
            .iter()
            .map(|r| match r.log_file.as_deref() {
                Some(log) if r.failed_operation.is_some() => format!("{} see file://{}", r.result, log),
                Some(log) => format!("{} - file://{}", r.result, log),
                None => r.result.clone(),
            })
            .collect();

        let host_width = host_cells
            .iter()
            .map(|c| c.chars().count())
            .chain(["Hosts".len(), "Executed in".len()])
            .max()
            .unwrap_or_default();
        let elapsed = format!("{} ms", report.elapsed_ms);
        let result_width = result_cells
            .iter()
            .map(|c| c.chars().count())
            .chain(["Result".len(), elapsed.len()])
            .max()
            .unwrap_or_default();
        let separator = format!("+-{}-+-{}-+---------+", "-".repeat(host_width), "-".repeat(result_width));

        let mut lines = vec![
            separator.clone(),
            format!("| {:<hw$} | {:<rw$} | Changes |", "Hosts", "Result", hw = host_width, rw = result_width),
            separator.clone(),
        ];
        for (i, row) in report.hosts.iter().enumerate() {
            let changes = if row.changes == 0 {
                "-".to_string()
            } else {
                row.changes.to_string()
            };
            lines.push(format!(
                "| {:<hw$} | {:<rw$} | {:<7} |",
                host_cells[i],
                result_cells[i],
                changes,
                hw = host_width,
                rw = result_width
            ));
        }
        lines.push(separator.clone());
        lines.push(format!(
            "| {:<hw$} | {:<rw$} |         |",
            "Executed in",
            elapsed,
            hw = host_width,
            rw = result_width
        ));
        lines.push(separator);
        lines.join("\n")
    }

    /// silent / quiet 模式下不输出
    pub fn print(report: &RunReport, ctx: &RunContext, json: bool) -> Result<()> {
        if ctx.flags.silent || ctx.flags.quiet {
            return Ok(());
        }
        let rendered = if json {
            Self::render_json(report)?
        } else {
            Self::render_table(report)
        };
        ctx.spinner.println(&rendered);
        Ok(())
    }
}
