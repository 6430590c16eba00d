//! Text diagnostic commands
//!
//! ```text
//! stats              per-thread, per-opcode counters
//! stats reset        zero every counter
//! stats json         counters as JSON
//! pending            outstanding-request and busy-thread histograms
//! throughput [on|off]  show, enable or disable the per-second counters
//! ```

use crate::stats::{DispatchStats, unix_second};
use chunkvault_common::{Error, Result};
use std::fmt::Write;
use std::str::FromStr;

/// Parsed diagnostic command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagCommand {
    Stats,
    StatsReset,
    StatsJson,
    Pending,
    Throughput,
    ThroughputEnable,
    ThroughputDisable,
    Help,
}

impl FromStr for DiagCommand {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["stats"] => Ok(Self::Stats),
            ["stats", "reset"] => Ok(Self::StatsReset),
            ["stats", "json"] => Ok(Self::StatsJson),
            ["pending"] => Ok(Self::Pending),
            ["throughput"] => Ok(Self::Throughput),
            ["throughput", "on" | "enable"] => Ok(Self::ThroughputEnable),
            ["throughput", "off" | "disable"] => Ok(Self::ThroughputDisable),
            ["help"] | [] => Ok(Self::Help),
            _ => Err(Error::InvalidArgument(format!(
                "unknown diagnostic command: {line}"
            ))),
        }
    }
}

impl DiagCommand {
    /// Run the command and render its output
    pub fn execute(self, stats: &DispatchStats) -> Result<String> {
        match self {
            Self::Stats => Ok(stats.render()),
            Self::StatsReset => {
                stats.reset();
                Ok("counters reset\n".to_string())
            }
            Self::StatsJson => serde_json::to_string_pretty(&stats.snapshot())
                .map_err(|e| Error::internal(format!("cannot encode statistics: {e}"))),
            Self::Pending => Ok(stats.render_histograms()),
            Self::Throughput => Ok(render_throughput(stats)),
            Self::ThroughputEnable => {
                stats.throughput().set_enabled(true);
                Ok("throughput measurement enabled\n".to_string())
            }
            Self::ThroughputDisable => {
                stats.throughput().set_enabled(false);
                Ok("throughput measurement disabled\n".to_string())
            }
            Self::Help => Ok(
                "stats | stats reset | stats json | pending | throughput [on|off]\n".to_string(),
            ),
        }
    }
}

fn render_throughput(stats: &DispatchStats) -> String {
    let throughput = stats.throughput();
    if !throughput.is_enabled() {
        return "throughput measurement disabled\n".to_string();
    }
    let samples = throughput.samples(unix_second());
    let mut out = String::new();
    let _ = writeln!(out, "{:>12} {:>14} {:>14}", "second", "read_bytes", "write_bytes");
    for sample in samples
        .iter()
        .filter(|s| s.read_bytes > 0 || s.write_bytes > 0)
    {
        let _ = writeln!(
            out,
            "{:>12} {:>14} {:>14}",
            sample.second, sample.read_bytes, sample.write_bytes
        );
    }
    let read: u64 = samples.iter().map(|s| s.read_bytes).sum();
    let write: u64 = samples.iter().map(|s| s.write_bytes).sum();
    let _ = writeln!(
        out,
        "last {}s: read {} B/s, write {} B/s",
        samples.len(),
        read / samples.len().max(1) as u64,
        write / samples.len().max(1) as u64
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Opcode, Reply};
    use chunkvault_storage::WriteOutcome;
    use std::time::Duration;

    #[test]
    fn test_parse() {
        assert_eq!("stats".parse::<DiagCommand>().unwrap(), DiagCommand::Stats);
        assert_eq!(
            "  stats   reset ".parse::<DiagCommand>().unwrap(),
            DiagCommand::StatsReset
        );
        assert_eq!(
            "throughput on".parse::<DiagCommand>().unwrap(),
            DiagCommand::ThroughputEnable
        );
        assert_eq!("".parse::<DiagCommand>().unwrap(), DiagCommand::Help);
        assert!("stats everything".parse::<DiagCommand>().is_err());
    }

    #[test]
    fn test_throughput_toggle() {
        let stats = DispatchStats::new(1);
        let out = DiagCommand::Throughput.execute(&stats).unwrap();
        assert!(out.contains("disabled"));

        DiagCommand::ThroughputEnable.execute(&stats).unwrap();
        assert!(stats.throughput().is_enabled());
        stats.record(
            0,
            Opcode::Write,
            &Ok(Reply::Written(WriteOutcome {
                written: 6000,
                file_size: 6000,
            })),
            Duration::ZERO,
        );
        let out = DiagCommand::Throughput.execute(&stats).unwrap();
        assert!(out.contains("6000"));

        DiagCommand::ThroughputDisable.execute(&stats).unwrap();
        assert!(!stats.throughput().is_enabled());
    }

    #[test]
    fn test_stats_reset_and_json() {
        let stats = DispatchStats::new(2);
        stats.record(0, Opcode::Remove, &Ok(Reply::Removed), Duration::ZERO);

        let json = DiagCommand::StatsJson.execute(&stats).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["totals"][Opcode::Remove.index()]["count"], 1);
        assert_eq!(value["totals"][Opcode::Remove.index()]["opcode"], "remove");

        DiagCommand::StatsReset.execute(&stats).unwrap();
        assert_eq!(stats.snapshot().totals[Opcode::Remove.index()].count, 0);
    }
}
