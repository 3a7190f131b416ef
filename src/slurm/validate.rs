// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::units::{format_storage_mb, format_walltime, parse_storage, parse_walltime};

/// Per-cluster maxima as written in configuration. Storage and walltime
/// values stay strings until validation so config loading never needs to
/// understand units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmRules {
    pub max_nodes: Option<u64>,
    pub max_tasks: Option<u64>,
    pub max_cpus_per_task: Option<u64>,
    pub max_memory_per_cpu: Option<String>,
    pub max_memory: Option<String>,
    pub max_gpus: Option<u64>,
    pub max_walltime: Option<String>,
}

/// Fully-resolved per-job ceiling, bytes and seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ceiling {
    pub nodes: u64,
    pub tasks: u64,
    pub cpus_per_task: u64,
    pub memory_per_cpu: u64,
    pub memory: u64,
    pub gpus: u64,
    pub walltime_secs: u64,
}

/// Hard default ceiling applied regardless of cluster configuration:
/// 50 nodes, 50 tasks, 50 cpus/task, 10 GB/cpu, 50 GB total, 20 GPUs, 10 h.
pub const DEFAULT_CEILING: Ceiling = Ceiling {
    nodes: 50,
    tasks: 50,
    cpus_per_task: 50,
    memory_per_cpu: 10 * 1024 * 1024 * 1024,
    memory: 50 * 1024 * 1024 * 1024,
    gpus: 20,
    walltime_secs: 10 * 3600,
};

/// Validated resource request extracted from a job's opaque slurm mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlurmRequest {
    pub nodes: Option<u64>,
    pub tasks: Option<u64>,
    pub cpus_per_task: Option<u64>,
    pub memory_per_cpu: Option<u64>,
    pub memory: Option<u64>,
    pub gpus: Option<u64>,
    pub walltime_secs: Option<u64>,
    pub partition: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("invalid slurm value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
    #[error("invalid slurm rule for {field}: {value}")]
    BadRule { field: &'static str, value: String },
    #[error("slurm request for {field} exceeds the ceiling: {requested} > {maximum}")]
    OverCeiling {
        field: &'static str,
        requested: String,
        maximum: String,
    },
}

impl Ceiling {
    fn lower(&mut self, rules: &SlurmRules) -> Result<(), ValidateError> {
        if let Some(v) = rules.max_nodes {
            self.nodes = self.nodes.min(v);
        }
        if let Some(v) = rules.max_tasks {
            self.tasks = self.tasks.min(v);
        }
        if let Some(v) = rules.max_cpus_per_task {
            self.cpus_per_task = self.cpus_per_task.min(v);
        }
        if let Some(raw) = &rules.max_memory_per_cpu {
            let v = parse_storage(raw).ok_or(ValidateError::BadRule {
                field: "memory_per_cpu",
                value: raw.clone(),
            })?;
            self.memory_per_cpu = self.memory_per_cpu.min(v);
        }
        if let Some(raw) = &rules.max_memory {
            let v = parse_storage(raw).ok_or(ValidateError::BadRule {
                field: "memory",
                value: raw.clone(),
            })?;
            self.memory = self.memory.min(v);
        }
        if let Some(v) = rules.max_gpus {
            self.gpus = self.gpus.min(v);
        }
        if let Some(raw) = &rules.max_walltime {
            let v = parse_walltime(raw).ok_or(ValidateError::BadRule {
                field: "walltime",
                value: raw.clone(),
            })?;
            self.walltime_secs = self.walltime_secs.min(v);
        }
        Ok(())
    }
}

/// Element-wise minimum (under unit-aware comparison) of the cluster input
/// rules, the cluster global cap and the hard default ceiling.
pub fn effective_ceiling(
    input_rules: Option<&SlurmRules>,
    global_cap: Option<&SlurmRules>,
) -> Result<Ceiling, ValidateError> {
    let mut ceiling = DEFAULT_CEILING;
    if let Some(rules) = input_rules {
        ceiling.lower(rules)?;
    }
    if let Some(cap) = global_cap {
        ceiling.lower(cap)?;
    }
    Ok(ceiling)
}

fn parse_count(
    map: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<u64>, ValidateError> {
    match map.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ValidateError::Invalid {
                field: key,
                value: raw.clone(),
            }),
        None => Ok(None),
    }
}

fn check_count(
    field: &'static str,
    requested: Option<u64>,
    maximum: u64,
) -> Result<(), ValidateError> {
    match requested {
        Some(v) if v > maximum => Err(ValidateError::OverCeiling {
            field,
            requested: v.to_string(),
            maximum: maximum.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Normalize and cap a job's slurm mapping against its effective ceiling.
/// Rejection never reaches the queue; unknown keys are ignored.
pub fn validate_slurm(
    map: &HashMap<String, String>,
    input_rules: Option<&SlurmRules>,
    global_cap: Option<&SlurmRules>,
) -> Result<SlurmRequest, ValidateError> {
    let ceiling = effective_ceiling(input_rules, global_cap)?;

    let request = SlurmRequest {
        nodes: parse_count(map, "nodes")?,
        tasks: parse_count(map, "ntasks")?,
        cpus_per_task: parse_count(map, "cpus_per_task")?,
        memory_per_cpu: map
            .get("memory_per_cpu")
            .map(|raw| {
                parse_storage(raw).ok_or(ValidateError::Invalid {
                    field: "memory_per_cpu",
                    value: raw.clone(),
                })
            })
            .transpose()?,
        memory: map
            .get("memory")
            .map(|raw| {
                parse_storage(raw).ok_or(ValidateError::Invalid {
                    field: "memory",
                    value: raw.clone(),
                })
            })
            .transpose()?,
        gpus: parse_count(map, "gpus")?,
        walltime_secs: map
            .get("walltime")
            .map(|raw| {
                parse_walltime(raw).ok_or(ValidateError::Invalid {
                    field: "walltime",
                    value: raw.clone(),
                })
            })
            .transpose()?,
        partition: map.get("partition").cloned(),
    };

    check_count("nodes", request.nodes, ceiling.nodes)?;
    check_count("ntasks", request.tasks, ceiling.tasks)?;
    check_count("cpus_per_task", request.cpus_per_task, ceiling.cpus_per_task)?;
    check_count("gpus", request.gpus, ceiling.gpus)?;

    if let Some(v) = request.memory_per_cpu {
        if v > ceiling.memory_per_cpu {
            return Err(ValidateError::OverCeiling {
                field: "memory_per_cpu",
                requested: format_storage_mb(v),
                maximum: format_storage_mb(ceiling.memory_per_cpu),
            });
        }
    }
    if let Some(v) = request.memory {
        if v > ceiling.memory {
            return Err(ValidateError::OverCeiling {
                field: "memory",
                requested: format_storage_mb(v),
                maximum: format_storage_mb(ceiling.memory),
            });
        }
    }
    if let Some(v) = request.walltime_secs {
        if v > ceiling.walltime_secs {
            return Err(ValidateError::OverCeiling {
                field: "walltime",
                requested: format_walltime(v),
                maximum: format_walltime(ceiling.walltime_secs),
            });
        }
    }

    Ok(request)
}
