// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use clap::{ArgGroup, Parser};
use log::*;
use std::{fs, path::PathBuf, process};
use thiserror::Error;
use tpmtools::{
    flush::HandleCategory,
    pcr::PcrIndex,
    persistent::PersistentHandle,
    signer::{sign_with_key_source, KeySource, SignOptions},
    tpm::{Context, TpmError, DEFAULT_TPM_PATH, TPM_PATH_ENV_VAR},
};

#[derive(Error, Debug)]
enum SignError {
    #[error("TPM error")]
    Tpm(#[from] TpmError),
    #[error("Either a key file or a persistent handle is required")]
    MissingKey,
    #[error("Failed to read key context from {path}")]
    ReadKeyContext {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Parser)]
#[command(
    about = "Sign a test message with a key loaded from a saved context or a persistent handle"
)]
#[command(group(
    ArgGroup::new("key")
        .required(true)
        .args(["key_file", "persistent_handle"])
))]
struct Args {
    /// TPM device path or TCTI configuration string
    #[arg(long, env = TPM_PATH_ENV_VAR, default_value = DEFAULT_TPM_PATH)]
    tpm_path: String,
    /// Key context saved by tpm_import_key
    #[arg(long)]
    key_file: Option<PathBuf>,
    /// Persistent handle of the key (0x81008000-0x8100FFFF)
    #[arg(long)]
    persistent_handle: Option<PersistentHandle>,
    /// PCR the signature is bound to (-1 disables the binding)
    #[arg(long, allow_negative_numbers = true, default_value_t = -1)]
    bind_pcr_value: i64,
    /// Handles to flush before signing: transient, loaded, saved or all
    #[arg(long, default_value_t = HandleCategory::All)]
    flush: HandleCategory,
}

fn key_source(args: &Args) -> Result<KeySource, SignError> {
    match (&args.key_file, args.persistent_handle) {
        (Some(path), _) => {
            let context =
                fs::read(path).map_err(|source| SignError::ReadKeyContext {
                    path: path.display().to_string(),
                    source,
                })?;
            debug!("Loaded key context from {}", path.display());
            Ok(KeySource::Context(context))
        }
        (None, Some(handle)) => Ok(KeySource::Persistent(handle)),
        (None, None) => Err(SignError::MissingKey),
    }
}

fn run(args: Args) -> Result<(), SignError> {
    let options = SignOptions {
        flush: args.flush,
        key: key_source(&args)?,
        pcr: PcrIndex::from_flag(args.bind_pcr_value),
    };

    let mut context = Context::open(&args.tpm_path)?;
    let _ = sign_with_key_source(&mut context, &options)?;

    Ok(())
}

fn main() {
    let args = Args::parse();
    tpmtools::logging::init();

    if let Err(e) = run(args) {
        tpmtools::logging::log_error(&e);
        process::exit(1);
    }
}
