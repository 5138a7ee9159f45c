// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use clap::Parser;
use log::*;
use std::{fs, path::PathBuf, process};
use thiserror::Error;
use tpmtools::{
    flush::HandleCategory,
    import::{import_signing_key, ImportOptions},
    import_blob::{ImportBlob, ImportBlobError},
    pcr::PcrIndex,
    persistent::PersistentHandle,
    tpm::{Context, TpmError, DEFAULT_TPM_PATH, TPM_PATH_ENV_VAR},
};

#[derive(Error, Debug)]
enum ImportKeyError {
    #[error("Invalid import blob")]
    ImportBlob(#[from] ImportBlobError),
    #[error("TPM error")]
    Tpm(#[from] TpmError),
    #[error("Failed to write key context to {path}")]
    WriteKeyContext {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Parser)]
#[command(
    about = "Import a signing key wrapped for the TPM endorsement key, persist it and sign a test message with it"
)]
struct Args {
    /// TPM device path or TCTI configuration string
    #[arg(long, env = TPM_PATH_ENV_VAR, default_value = DEFAULT_TPM_PATH)]
    tpm_path: String,
    /// Import blob (protobuf ImportBlob) holding the wrapped signing key
    #[arg(long)]
    import_signing_key_file: PathBuf,
    /// File the imported key context is saved to
    #[arg(long, default_value = "key.dat")]
    key_handle_output_file: PathBuf,
    /// PCR the test signature is bound to (-1 disables the binding)
    #[arg(long, allow_negative_numbers = true, default_value_t = -1)]
    bind_pcr_value: i64,
    /// Persistent handle the key is stored at (0x81008000-0x8100FFFF)
    #[arg(long, default_value_t = PersistentHandle::default())]
    persistent_handle: PersistentHandle,
    /// Evict the key already stored at the persistent handle
    #[arg(long)]
    evict: bool,
    /// Handles to flush before importing: transient, loaded, saved or all
    #[arg(long, default_value_t = HandleCategory::Transient)]
    flush: HandleCategory,
}

fn run(args: Args) -> Result<(), ImportKeyError> {
    let options = ImportOptions {
        flush: args.flush,
        persistent_handle: args.persistent_handle,
        evict: args.evict,
        pcr: PcrIndex::from_flag(args.bind_pcr_value),
    };

    let blob = ImportBlob::from_file(&args.import_signing_key_file)?;
    debug!(
        "Loaded import blob from {}",
        args.import_signing_key_file.display()
    );

    let mut context = Context::open(&args.tpm_path)?;
    let outcome = import_signing_key(&mut context, &blob, &options)?;

    let path = &args.key_handle_output_file;
    fs::write(path, &outcome.key_context).map_err(|source| {
        ImportKeyError::WriteKeyContext {
            path: path.display().to_string(),
            source,
        }
    })?;
    info!("Key context saved to {}", path.display());

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
