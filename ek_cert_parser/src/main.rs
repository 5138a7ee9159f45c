// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

use clap::Parser;
use log::*;
use std::{path::PathBuf, process};
use thiserror::Error;
use tpmtools::cert::{instance_info_from_file, CertError, InstanceInfo};

#[derive(Error, Debug)]
enum EkCertError {
    #[error("Failed to read the instance identity from {path}")]
    Cert {
        path: String,
        source: CertError,
    },
}

#[derive(Parser)]
#[command(
    about = "Print the Google Compute Engine instance identity embedded in an EK certificate"
)]
struct Args {
    /// PEM file holding the EK certificate
    #[arg(long, default_value = "/tmp/ekcert.pem")]
    cert_pem: PathBuf,
}

fn log_instance_info(info: &InstanceInfo) {
    info!("InstanceID: {}", info.instance_id);
    info!("InstanceName: {}", info.instance_name);
    info!("ProjectId: {}", info.project_id);
    info!("ProjectNumber: {}", info.project_number);
    info!("Zone: {}", info.zone);

    if let Some(props) = &info.security_properties {
        if let Some(version) = props.security_version {
            info!("SecurityVersion: {version}");
        }
        if let Some(production) = props.is_production {
            info!("IsProduction: {production}");
        }
    }
}

fn run(args: Args) -> Result<(), EkCertError> {
    let info = instance_info_from_file(&args.cert_pem).map_err(|source| {
        EkCertError::Cert {
            path: args.cert_pem.display().to_string(),
            source,
        }
    })?;

    log_instance_info(&info);
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
