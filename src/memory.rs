use std::fs;

/// 内存使用快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// 当前进程的常驻内存
    pub resident_bytes: u64,
    /// 系统剩余可用内存
    pub available_bytes: u64,
}

/// 查询宿主机的内存状态
pub trait MemoryMonitor: Send + Sync {
    fn current_usage(&self) -> MemoryUsage;
}

/// 读取 /proc 获取内存信息，其他平台上视为内存不受限
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryMonitor;

impl MemoryMonitor for SystemMemoryMonitor {
    fn current_usage(&self) -> MemoryUsage {
        MemoryUsage {
            resident_bytes: read_kb_field("/proc/self/status", "VmRSS:").unwrap_or(0),
            available_bytes: read_kb_field("/proc/meminfo", "MemAvailable:").unwrap_or(u64::MAX),
        }
    }
}

/// 返回固定数值，用于测试和限制构建规模
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryMonitor(pub MemoryUsage);

impl FixedMemoryMonitor {
    pub fn available(bytes: u64) -> Self {
        Self(MemoryUsage { resident_bytes: 0, available_bytes: bytes })
    }
}

impl MemoryMonitor for FixedMemoryMonitor {
    fn current_usage(&self) -> MemoryUsage {
        self.0
    }
}

/// 读取形如 `MemAvailable:   123456 kB` 的字段，返回字节数
fn read_kb_field(file: &str, key: &str) -> Option<u64> {
    let content = fs::read_to_string(file).ok()?;
    parse_kb_field(&content, key)
}

fn parse_kb_field(content: &str, key: &str) -> Option<u64> {
    content.lines().find(|line| line.starts_with(key)).and_then(|line| {
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    })
}
