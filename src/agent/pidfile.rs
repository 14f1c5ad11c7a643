//! PID 文件：同一数据目录只运行一个 Agent

use std::fs;
use std::os::unix::fs::PermissionsExt;

use crate::config::AgentConfig;
use crate::error::Result;

/// 写入 PID 文件
pub(crate) fn write_pid_file(config: &AgentConfig) -> Result<()> {
    fs::create_dir_all(&config.data_dir)?;
    let pid = std::process::id();
    let pid_path = config.pid_path();
    fs::write(&pid_path, pid.to_string())?;
    fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
    tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
    Ok(())
}

pub(crate) fn remove_pid_file(config: &AgentConfig) {
    let pid_path = config.pid_path();
    if pid_path.exists() {
        let _ = fs::remove_file(&pid_path);
    }
}

/// 检查 Agent 是否正在运行
pub fn is_agent_running(config: &AgentConfig) -> bool {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return false;
    }

    let pid_str = match fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // 检查进程是否存在
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 Agent 状态（PID 文件与插件 socket）
pub fn cleanup_stale_agent(config: &AgentConfig) -> Result<()> {
    let pid_path = config.pid_path();
    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    let run_dir = config.run_dir();
    if run_dir.exists() {
        for entry in fs::read_dir(&run_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "sock") {
                fs::remove_file(&path)?;
                tracing::debug!("🧹 删除残留 socket: {:?}", path);
            }
        }
    }

    Ok(())
}
