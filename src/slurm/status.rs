// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::state::models::UsageCounters;

use super::units::parse_storage;

/// Coarse view of a remote Slurm job as the maintainer polls it.
/// `C`/`CD`/`UNKNOWN` mean completed (a job that left the queue reports no
/// state at all); `F`/`NF`/`ERROR` mean failed; anything else is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteJobStatus {
    Running,
    Completed,
    Failed,
}

pub fn classify_status(token: &str) -> RemoteJobStatus {
    let normalized = token.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "" | "C" | "CD" | "UNKNOWN" => RemoteJobStatus::Completed,
        "F" | "NF" | "ERROR" => RemoteJobStatus::Failed,
        _ => RemoteJobStatus::Running,
    }
}

pub fn squeue_status_command(slurm_id: i64) -> String {
    format!("squeue -j {slurm_id} -h -o %t")
}

pub fn scancel_command(slurm_id: i64) -> String {
    format!("scancel {slurm_id}")
}

pub fn sacct_usage_command(slurm_id: i64) -> String {
    format!("sacct -j {slurm_id} -n -P -o NNodes,NCPUs,CPUTimeRAW,ReqMem,MaxRSS,ElapsedRaw")
}

pub fn parse_job_id(line: &str) -> Option<i64> {
    // Expect message from sbatch like: "Submitted batch job 11"
    let marker = "job ";
    let idx = line.find(marker)?;
    let after_job = &line[idx + marker.len()..];
    after_job.trim().parse::<i64>().ok()
}

/// Parse the first accounting line of `sacct -n -P` output into usage
/// counters. Fields that fail to parse stay unset rather than failing the
/// collection.
pub fn parse_sacct_usage(output: &str) -> UsageCounters {
    let Some(line) = output.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return UsageCounters::default();
    };
    let mut fields = line.split('|');
    let nodes = fields.next().and_then(|v| v.trim().parse::<i64>().ok());
    let cpus = fields.next().and_then(|v| v.trim().parse::<i64>().ok());
    let cpu_time = fields.next().and_then(|v| v.trim().parse::<i64>().ok());
    let memory = fields.next().and_then(parse_accounting_memory);
    let memory_usage = fields.next().and_then(parse_accounting_memory);
    let walltime = fields.next().and_then(|v| v.trim().parse::<i64>().ok());
    UsageCounters {
        nodes,
        cpus,
        cpu_time,
        memory,
        memory_usage,
        walltime,
    }
}

/// Accounting memory values carry unit suffixes and, for ReqMem on older
/// Slurm, a per-node/per-cpu marker ("4Gn", "2Gc").
fn parse_accounting_memory(raw: &str) -> Option<i64> {
    let trimmed = raw
        .trim()
        .trim_end_matches(|c| c == 'n' || c == 'c' || c == 'N' || c == 'C');
    if trimmed.is_empty() {
        return None;
    }
    parse_storage(trimmed).map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_tokens_classify_as_completed() {
        for token in ["C", "CD", "cd", "UNKNOWN", ""] {
            assert_eq!(classify_status(token), RemoteJobStatus::Completed);
        }
    }

    #[test]
    fn failed_tokens_classify_as_failed() {
        for token in ["F", "NF", "ERROR", "error"] {
            assert_eq!(classify_status(token), RemoteJobStatus::Failed);
        }
    }

    #[test]
    fn anything_else_is_running() {
        for token in ["R", "PD", "CG", "S"] {
            assert_eq!(classify_status(token), RemoteJobStatus::Running);
        }
    }

    #[test]
    fn parses_sbatch_submission_line() {
        assert_eq!(parse_job_id("Submitted batch job 11"), Some(11));
        assert_eq!(parse_job_id("Submitted batch job 11\n"), Some(11));
        assert_eq!(parse_job_id("sbatch: error"), None);
    }

    #[test]
    fn parses_sacct_usage_line() {
        let usage = parse_sacct_usage("2|8|3600|4Gn|123456K|1800|\n");
        assert_eq!(usage.nodes, Some(2));
        assert_eq!(usage.cpus, Some(8));
        assert_eq!(usage.cpu_time, Some(3600));
        assert_eq!(usage.memory, Some(4 * 1024 * 1024 * 1024));
        assert_eq!(usage.memory_usage, Some(123456 * 1024));
        assert_eq!(usage.walltime, Some(1800));
    }

    #[test]
    fn empty_sacct_output_leaves_counters_unset() {
        assert_eq!(parse_sacct_usage(""), UsageCounters::default());
        assert_eq!(parse_sacct_usage("\n\n"), UsageCounters::default());
    }

    #[test]
    fn unparseable_fields_stay_unset() {
        let usage = parse_sacct_usage("2|eight|||?|90|");
        assert_eq!(usage.nodes, Some(2));
        assert_eq!(usage.cpus, None);
        assert_eq!(usage.memory, None);
        assert_eq!(usage.walltime, Some(90));
    }
}
