//! Host introspection one-liners and their parsers.

use super::HostConnection;
use crate::error::{CoreError, Result};

/// One CPU/memory/disk sample, all in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

const OS_RELEASE_CMD: &str =
    r#"sed -n 's/^PRETTY_NAME="\(.*\)"$/\1/p' /etc/os-release"#;
const CPU_CMD: &str =
    r#"top -bn1 | awk '/Cpu\(s\)/ {print 100 - $8; exit}'"#;
const MEMORY_CMD: &str =
    r#"free | awk '/Mem:/ {printf "%.2f", $3/$2*100}'"#;
const DISK_CMD: &str =
    r#"df -P / | awk 'NR==2 {sub("%","",$5); print $5}'"#;

fn parse_scalar(raw: &str, what: &str) -> Result<f64> {
    raw.trim().parse().map_err(|_| {
        CoreError::remote_step(format!("unparsable {what} output: {raw:?}"))
    })
}

impl HostConnection {
    pub fn get_os_release(&mut self) -> Result<String> {
        self.run(OS_RELEASE_CMD)
    }

    pub fn get_cpu_usage(&mut self) -> Result<f64> {
        let raw = self.run(CPU_CMD)?;
        parse_scalar(&raw, "cpu")
    }

    pub fn get_memory_usage(&mut self) -> Result<f64> {
        let raw = self.run(MEMORY_CMD)?;
        parse_scalar(&raw, "memory")
    }

    pub fn get_disk_usage(&mut self) -> Result<f64> {
        let raw = self.run(DISK_CMD)?;
        parse_scalar(&raw, "disk")
    }

    /// All three samples over one channel round-trip.
    pub fn get_combined_usage(&mut self) -> Result<HostUsage> {
        let cmd = format!("{CPU_CMD}; echo; {MEMORY_CMD}; echo; {DISK_CMD}");
        let raw = self.run(&cmd)?;
        parse_combined_usage(&raw)
    }
}

pub(crate) fn parse_combined_usage(raw: &str) -> Result<HostUsage> {
    let mut values = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());

    let mut next = |what: &str| -> Result<f64> {
        values
            .next()
            .ok_or_else(|| {
                CoreError::remote_step(format!(
                    "missing {what} in usage output: {raw:?}"
                ))
            })
            .and_then(|line| parse_scalar(line, what))
    };

    Ok(HostUsage {
        cpu: next("cpu")?,
        memory: next("memory")?,
        disk: next("disk")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_usage() {
        let usage = parse_combined_usage("12.5\n34.21\n71\n").unwrap();
        assert_eq!(usage.cpu, 12.5);
        assert_eq!(usage.memory, 34.21);
        assert_eq!(usage.disk, 71.0);
    }

    #[test]
    fn rejects_truncated_output() {
        assert!(parse_combined_usage("12.5\n34.21\n").is_err());
        assert!(parse_combined_usage("garbage\n1\n2\n").is_err());
    }
}
