use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 每台主机一个日志文件，写入失败不影响执行
#[derive(Debug, Clone)]
pub struct RunLogger {
    directory: Option<PathBuf>,
}

impl RunLogger {
    /// 在 `base` 下为本次运行创建独立目录
    pub fn new(base: &Path) -> Self {
        let run_id = format!(
            "{}-{:08x}",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            rand::random::<u32>()
        );
        let directory = base.join(run_id);
        match std::fs::create_dir_all(&directory) {
            Ok(()) => Self {
                directory: Some(directory),
            },
            Err(e) => {
                warn!("Unable to create log directory {}: {}", directory.display(), e);
                Self { directory: None }
            }
        }
    }

    /// NOLOG 或测试时使用
    pub fn disabled() -> Self {
        Self { directory: None }
    }

    pub fn host_log_path(&self, host: &str) -> Option<PathBuf> {
        let name: String = host
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", name)))
    }

    pub fn host_event(&self, host: &str, text: &str) {
        let Some(path) = self.host_log_path(host) else {
            return;
        };
        let line = format!(
            "{} {}\n",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            text
        );
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            warn!("Unable to write host log {}: {}", path.display(), e);
        }
    }

    pub fn debug_event(&self, text: &str) {
        debug!("{}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_event_appends() {
        let base = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(base.path());
        logger.host_event("web1", "shellStdOut: hello");
        logger.host_event("web1", "shellStdOut: world");

        let path = logger.host_log_path("web1").unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("shellStdOut: hello"));
        assert!(content.ends_with("shellStdOut: world\n"));
    }

    #[test]
    fn test_disabled_logger_writes_nothing() {
        let logger = RunLogger::disabled();
        assert!(logger.host_log_path("web1").is_none());
        logger.host_event("web1", "ignored");
    }
}
