// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use log::*;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Initializes the logger for the command line tools.
///
/// Honors `RUST_LOG` when set; otherwise logs at `info` so the handle
/// counts, digests and signatures reach stderr.
pub fn init() {
    let filters = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());

    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();
}

/// Logs `err` followed by the chain of errors that caused it
pub fn log_error(err: &dyn std::error::Error) {
    error!("{err}");
    let mut source = err.source();
    while let Some(cause) = source {
        error!("  caused by: {cause}");
        source = cause.source();
    }
}
