// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Copy, Clone, Debug)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

pub fn init(verbose: bool) {
    let filter = build_filter(verbose);
    let registry = Registry::default().with(filter);

    match parse_format() {
        LogFormat::Json => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(UtcTime::rfc_3339());
            registry.with(stdout_layer).init();
        }
        LogFormat::Pretty => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_timer(UtcTime::rfc_3339());
            registry.with(stdout_layer).init();
        }
        LogFormat::Compact => {
            let stdout_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(UtcTime::rfc_3339());
            registry.with(stdout_layer).init();
        }
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    match env::var("JOBSUPD_LOG") {
        Ok(value) => EnvFilter::new(value),
        Err(_) => {
            if verbose {
                EnvFilter::new("debug")
            } else {
                EnvFilter::new("info")
            }
        }
    }
}

fn parse_format() -> LogFormat {
    match env::var("JOBSUPD_LOG_FORMAT")
        .ok()
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_lowercase())
    {
        Some(value) if value == "json" => LogFormat::Json,
        Some(value) if value == "pretty" => LogFormat::Pretty,
        _ => LogFormat::Compact,
    }
}
