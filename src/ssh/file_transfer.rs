use crate::error::AutomationError;
use crate::ssh::client::SshClient;
use crate::types::FileTransferResult;
use crate::utils::generate_remote_temp_path;
use std::path::Path;
use tracing::info;

impl SshClient {
    /// 上传文件到远程主机：SHA256 校验 + 临时文件原子替换
    pub fn upload_file(
        &self,
        local_path: &str,
        remote_path: &str,
        mode: Option<&str>,
    ) -> Result<FileTransferResult, AutomationError> {
        // ========== 第一次 Hash：本地文件 ==========
        let local_hash_info = self.calculate_local_file_hash(local_path)?;
        info!(
            "[1/3] Local file hash: {} (size: {} bytes)",
            local_hash_info.hash, local_hash_info.size
        );

        // ========== 第二次 Hash：远程文件相同则跳过传输 ==========
        if let Some(remote_hash_info) = self.get_remote_file_hash(remote_path)? {
            if remote_hash_info.hash == local_hash_info.hash
                && remote_hash_info.size == local_hash_info.size
            {
                info!(
                    "[2/3] Remote file unchanged (hash: {}), skipping transfer",
                    remote_hash_info.hash
                );
                self.apply_file_mode(remote_path, mode)?;
                return Ok(FileTransferResult {
                    bytes_transferred: 0,
                    message: format!("File unchanged (hash: {})", remote_hash_info.hash),
                });
            }
        }

        let local_file = std::fs::File::open(local_path).map_err(|e| {
            AutomationError::FileOperationError(format!(
                "Failed to open local file {}: {}",
                local_path, e
            ))
        })?;

        // 创建目录（如果需要）
        if let Some(parent_dir) = Path::new(remote_path).parent() {
            let parent_str = parent_dir.to_string_lossy();
            if !parent_str.is_empty() && parent_str != "/" {
                let mkdir_result = self.execute_command(&format!("mkdir -p '{}'", parent_str))?;
                if mkdir_result.exit_code != 0 {
                    return Err(AutomationError::FileOperationError(format!(
                        "Failed to create directory {}: {}",
                        parent_str, mkdir_result.stderr
                    )));
                }
            }
        }

        let temp_remote_path = generate_remote_temp_path(remote_path);
        let mut remote_file = self.session.scp_send(
            Path::new(&temp_remote_path),
            0o600,
            local_hash_info.size,
            None,
        )?;

        let mut local_reader = std::io::BufReader::new(local_file);
        let bytes_transferred =
            std::io::copy(&mut local_reader, &mut remote_file).map_err(|e| {
                AutomationError::FileOperationError(format!("Failed to transfer file: {}", e))
            })?;

        remote_file.send_eof()?;
        remote_file.wait_eof()?;
        remote_file.close()?;
        remote_file.wait_close()?;

        // ========== 第三次 Hash：校验传输结果 ==========
        let verified = self.get_remote_file_hash(&temp_remote_path)?;
        let matches = verified.as_ref().is_some_and(|remote| {
            remote.hash == local_hash_info.hash && remote.size == local_hash_info.size
        });
        if !matches {
            let _ = self.execute_command(&format!("rm -f '{}'", temp_remote_path));
            return Err(AutomationError::FileOperationError(format!(
                "File transfer verification FAILED for {} (local hash: {}, remote hash: {})",
                local_path,
                local_hash_info.hash,
                verified.map(|r| r.hash).unwrap_or_else(|| "none".to_string())
            )));
        }
        info!("[3/3] Transfer verification passed: {}", local_hash_info.hash);

        let mv_result =
            self.execute_command(&format!("mv '{}' '{}'", temp_remote_path, remote_path))?;
        if mv_result.exit_code != 0 {
            let _ = self.execute_command(&format!("rm -f '{}'", temp_remote_path));
            return Err(AutomationError::FileOperationError(format!(
                "Failed to move temp file to destination: {}",
                mv_result.stderr
            )));
        }

        self.apply_file_mode(remote_path, mode)?;

        info!(
            "File successfully copied and verified: {} -> {}:{}",
            local_path, self.config.hostname, remote_path
        );
        Ok(FileTransferResult {
            bytes_transferred,
            message: format!(
                "Successfully transferred {} bytes (hash: {})",
                bytes_transferred, local_hash_info.hash
            ),
        })
    }

    /// 设置文件权限（如果指定）
    fn apply_file_mode(&self, remote_path: &str, mode: Option<&str>) -> Result<(), AutomationError> {
        let Some(mode) = mode else {
            return Ok(());
        };
        let chmod_result = self.execute_command(&format!("chmod {} '{}'", mode, remote_path))?;
        if chmod_result.exit_code != 0 {
            return Err(AutomationError::FileOperationError(format!(
                "Failed to set file permissions {}: {}",
                mode, chmod_result.stderr
            )));
        }
        Ok(())
    }
}
