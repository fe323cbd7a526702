use crate::error::AutomationError;
use crate::ssh::client::SshClient;
use crate::types::FileHashInfo;

/// 远程文件不存在时输出的标记
const MISSING_MARK: &str = "__missing__";

impl SshClient {
    pub(super) fn calculate_local_file_hash(
        &self,
        local_path: &str,
    ) -> Result<FileHashInfo, AutomationError> {
        let size = std::fs::metadata(local_path)
            .map_err(|e| {
                AutomationError::FileOperationError(format!(
                    "Failed to read metadata of {}: {}",
                    local_path, e
                ))
            })?
            .len();
        Ok(FileHashInfo {
            hash: crate::utils::calculate_file_hash(local_path)?,
            size,
        })
    }

    /// 一次往返取得远程文件的大小和 sha256；文件不存在时返回 None
    pub(super) fn get_remote_file_hash(
        &self,
        remote_path: &str,
    ) -> Result<Option<FileHashInfo>, AutomationError> {
        let quoted = format!("'{}'", remote_path.replace('\'', "'\\''"));
        let probe = format!(
            "if [ ! -f {p} ]; then echo {m}; exit 0; fi; \
             (stat -c %s {p} 2>/dev/null || stat -f %z {p}); \
             (sha256sum {p} 2>/dev/null || shasum -a 256 {p})",
            p = quoted,
            m = MISSING_MARK
        );
        let result = self.execute_command(&probe)?;
        parse_probe_output(&result.stdout, result.exit_code, &result.stderr)
    }
}

fn parse_probe_output(
    stdout: &str,
    exit_code: i32,
    stderr: &str,
) -> Result<Option<FileHashInfo>, AutomationError> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next().unwrap_or_default();
    if first == MISSING_MARK {
        return Ok(None);
    }
    if exit_code != 0 {
        return Err(AutomationError::FileOperationError(format!(
            "Failed to calculate remote file hash: {}",
            stderr.trim()
        )));
    }
    let size = first.parse::<u64>().map_err(|e| {
        AutomationError::FileOperationError(format!("Unexpected remote file size '{}': {}", first, e))
    })?;
    // sha256sum 与 shasum 都以哈希开头
    let hash = lines
        .next()
        .and_then(|line| line.split_whitespace().next())
        .ok_or_else(|| AutomationError::FileOperationError("Remote hash is missing".to_string()))?;
    Ok(Some(FileHashInfo {
        hash: hash.to_string(),
        size,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        assert!(parse_probe_output("__missing__\n", 0, "").unwrap().is_none());

        let info = parse_probe_output("12\nabc123  /tmp/f\n", 0, "").unwrap().unwrap();
        assert_eq!(info.size, 12);
        assert_eq!(info.hash, "abc123");

        assert!(parse_probe_output("", 1, "permission denied").is_err());
        assert!(parse_probe_output("12\n", 0, "").is_err());
    }
}
