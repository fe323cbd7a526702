use crate::error::AutomationError;
use crate::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 生成唯一的临时文件后缀
///
/// 使用纳秒级时间戳 + 随机数，确保多主机并发构建脚本时不会产生文件名冲突。
pub fn generate_temp_suffix() -> String {
    let now = chrono::Utc::now();
    let timestamp = now.timestamp();
    let nanos = now.timestamp_subsec_nanos();
    let random_suffix: u32 = rand::random();

    format!("{}.{}.{}", timestamp, nanos, random_suffix)
}

/// 生成本地临时文件路径
///
/// # 示例
/// ```
/// let temp_path = rs_automation::utils::generate_local_temp_path("rs_automation_shell");
/// assert!(temp_path.ends_with(".tmp"));
/// ```
pub fn generate_local_temp_path(prefix: &str) -> String {
    std::env::temp_dir()
        .join(format!("{}_{}.tmp", prefix, generate_temp_suffix()))
        .to_string_lossy()
        .into_owned()
}

/// 生成远程临时文件路径
pub fn generate_remote_temp_path(base_path: &str) -> String {
    format!("{}.tmp.{}", base_path, generate_temp_suffix())
}

/// 计算本地文件的 SHA256
pub fn calculate_file_hash(path: &str) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        AutomationError::FileOperationError(format!("Failed to open {}: {}", path, e))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// 删除文件，文件已不存在时不报错
pub fn remove_file_quietly(path: &str) {
    if path.is_empty() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Temporary file removed: {}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Unable to remove {}: {}", path, e),
    }
}

/// 展开 `~/`
pub fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => std::env::var("HOME")
            .map(|home| Path::new(&home).join(rest))
            .unwrap_or_else(|_| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

/// copyTo 源文件：绝对路径原样，`~/` 展开，相对路径基于操作目录
pub fn resolve_local_source(ops_directory: &Path, operation_name: &str, src: &str) -> PathBuf {
    if src.starts_with('/') {
        PathBuf::from(src)
    } else if src.starts_with('~') {
        expand_home(src)
    } else {
        ops_directory
            .join("operations")
            .join(operation_name)
            .join(src.trim_start_matches("./"))
    }
}

/// 远程目标不含目录时放到 /tmp
pub fn remote_destination(dest: &str, src: &str) -> String {
    if dest.contains('/') {
        return dest.to_string();
    }
    let name = if dest.is_empty() {
        Path::new(src)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        dest.to_string()
    };
    format!("/tmp/{}", name)
}

/// `chmod` 需要 3 位八进制
pub fn parse_chmod(mode: &str) -> Option<u32> {
    if mode.len() != 3 {
        return None;
    }
    u32::from_str_radix(mode, 8).ok()
}
