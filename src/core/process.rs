//! 子进程监管：进程组终止（SIGTERM，宽限期后 SIGKILL）
//!
//! AI 子进程以独立进程组启动（pgid == pid），终止时对整组发信号，连带清理其派生的孙进程。

use std::time::Duration;

/// 向进程组发送 SIGTERM，等待宽限期后仍存活则 SIGKILL
#[cfg(unix)]
pub async fn terminate_process_group(pgid: u32, grace: Duration) {
    let pgid = pgid as libc::pid_t;
    if pgid <= 1 {
        return;
    }
    // SAFETY: kill(2) 只读取参数；负 pid 表示整个进程组
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc != 0 {
        // ESRCH：进程组已不存在
        return;
    }
    tracing::debug!(pgid, "sent SIGTERM to process group");

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !process_group_alive(pgid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // SAFETY: 同上
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        tracing::warn!(pgid, "process group ignored SIGTERM, sent SIGKILL");
    }
}

#[cfg(unix)]
fn process_group_alive(pgid: libc::pid_t) -> bool {
    // SAFETY: 信号 0 只做存在性检查
    unsafe { libc::kill(-pgid, 0) == 0 }
}

#[cfg(not(unix))]
pub async fn terminate_process_group(_pgid: u32, _grace: Duration) {}
