// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::util::remote_path::sh_escape;

use super::units::{format_storage_mb, format_walltime};
use super::validate::SlurmRequest;

/// Remote workspaces a submission script runs against.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub executable: String,
    pub data: Option<String>,
    pub result: String,
}

/// Commands around the main payload, taken from the executable manifest
/// (community variant) or the job parameters (bare variant).
#[derive(Debug, Clone, Default)]
pub struct Stages {
    pub pre: Option<String>,
    pub execution: String,
    pub post: Option<String>,
}

/// Singularity wrap for community contributions.
#[derive(Debug, Clone)]
pub struct ContainerWrap {
    pub image: String,
    pub binds: Vec<(String, String)>,
    /// Containers resolved from CVMFS need the mount visible inside.
    pub cvmfs: bool,
    /// Environment bootstrap lines (module loads etc.) emitted verbatim
    /// before the payload.
    pub env_init: Vec<String>,
}

#[derive(Debug)]
pub struct ScriptSpec<'a> {
    pub job_id: &'a str,
    pub request: &'a SlurmRequest,
    pub paths: &'a JobPaths,
    pub env: &'a HashMap<String, String>,
    pub param: &'a HashMap<String, String>,
    pub stages: &'a Stages,
    pub wrap: Option<&'a ContainerWrap>,
}

pub const STDOUT_FILE: &str = "job.stdout";
pub const STDERR_FILE: &str = "job.stderr";

/// Render the full sbatch submission script.
pub fn render_sbatch(spec: &ScriptSpec<'_>) -> String {
    let mut out = String::from("#!/bin/bash\n");
    let _ = writeln!(out, "#SBATCH --job-name=jobsup_{}", spec.job_id);
    let _ = writeln!(
        out,
        "#SBATCH --output={}/{}",
        spec.paths.result, STDOUT_FILE
    );
    let _ = writeln!(out, "#SBATCH --error={}/{}", spec.paths.result, STDERR_FILE);

    let req = spec.request;
    if let Some(v) = req.nodes {
        let _ = writeln!(out, "#SBATCH --nodes={v}");
    }
    if let Some(v) = req.tasks {
        let _ = writeln!(out, "#SBATCH --ntasks={v}");
    }
    if let Some(v) = req.cpus_per_task {
        let _ = writeln!(out, "#SBATCH --cpus-per-task={v}");
    }
    if let Some(v) = req.memory_per_cpu {
        let _ = writeln!(out, "#SBATCH --mem-per-cpu={}", format_storage_mb(v));
    }
    if let Some(v) = req.memory {
        let _ = writeln!(out, "#SBATCH --mem={}", format_storage_mb(v));
    }
    if let Some(v) = req.gpus {
        let _ = writeln!(out, "#SBATCH --gpus={v}");
    }
    if let Some(v) = req.walltime_secs {
        let _ = writeln!(out, "#SBATCH --time={}", format_walltime(v));
    }
    if let Some(p) = &req.partition {
        let _ = writeln!(out, "#SBATCH --partition={p}");
    }

    out.push('\n');
    let _ = writeln!(out, "export JOB_ID={}", sh_escape(spec.job_id));
    let _ = writeln!(
        out,
        "export EXECUTABLE_FOLDER={}",
        sh_escape(&spec.paths.executable)
    );
    if let Some(data) = &spec.paths.data {
        let _ = writeln!(out, "export DATA_FOLDER={}", sh_escape(data));
    }
    let _ = writeln!(out, "export RESULT_FOLDER={}", sh_escape(&spec.paths.result));

    let mut env_keys: Vec<&String> = spec.env.keys().collect();
    env_keys.sort();
    for key in env_keys {
        let _ = writeln!(out, "export {}={}", key, sh_escape(&spec.env[key]));
    }
    let mut param_keys: Vec<&String> = spec.param.keys().collect();
    param_keys.sort();
    for key in param_keys {
        let _ = writeln!(out, "export param_{}={}", key, sh_escape(&spec.param[key]));
    }

    if let Some(wrap) = spec.wrap {
        for line in &wrap.env_init {
            let _ = writeln!(out, "{line}");
        }
    }

    out.push('\n');
    let _ = writeln!(out, "cd \"$EXECUTABLE_FOLDER\"");
    if let Some(pre) = &spec.stages.pre {
        let _ = writeln!(out, "{pre}");
    }
    let _ = writeln!(out, "{}", payload_line(spec));
    if let Some(post) = &spec.stages.post {
        let _ = writeln!(out, "{post}");
    }

    out
}

fn payload_line(spec: &ScriptSpec<'_>) -> String {
    let Some(wrap) = spec.wrap else {
        return spec.stages.execution.clone();
    };

    let mut cmd = String::from("singularity exec");
    let mut binds: Vec<(String, String)> = vec![
        (spec.paths.executable.clone(), spec.paths.executable.clone()),
        (spec.paths.result.clone(), spec.paths.result.clone()),
    ];
    if let Some(data) = &spec.paths.data {
        binds.push((data.clone(), data.clone()));
    }
    if wrap.cvmfs {
        binds.push(("/cvmfs".to_string(), "/cvmfs".to_string()));
    }
    binds.extend(wrap.binds.iter().cloned());

    for (from, to) in binds {
        let _ = write!(cmd, " --bind {from}:{to}");
    }
    let _ = write!(
        cmd,
        " {} bash -c {}",
        wrap.image,
        sh_escape(&spec.stages.execution)
    );
    cmd
}

/// Command submitted on the cluster to enqueue the script.
pub fn submit_command(script_path: &str, chdir: &str) -> String {
    format!("sbatch --chdir {chdir} {script_path}")
}
