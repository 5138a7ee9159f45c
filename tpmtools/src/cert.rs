// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Keylime Authors

//! Cloud instance identity carried by Google Compute Engine EK certificates.

use std::{fs, path::Path};
use thiserror::Error;
use x509_parser::{
    der_parser::{
        ber::{BerObject, Class},
        der::parse_der,
    },
    parse_x509_certificate,
    pem::parse_x509_pem,
};

/// OID of the GCE instance information extension
pub const GCE_INSTANCE_INFO_OID: &str = "1.3.6.1.4.1.11129.2.1.21";

const PEM_CERTIFICATE_LABEL: &str = "CERTIFICATE";

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Could not read certificate file {path}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Could not decode PEM block: {0}")]
    PemDecode(String),

    #[error("Unexpected PEM type: {0}")]
    UnexpectedPemType(String),

    #[error("Unexpected trailing data after the certificate PEM block")]
    TrailingData,

    #[error("Could not parse X.509 certificate: {0}")]
    CertificateParse(String),

    #[error("Certificate has no GCE instance information extension")]
    MissingInstanceInfo,

    #[error("Malformed GCE instance information: {0}")]
    MalformedInstanceInfo(String),
}

/// `securityProperties` of the instance information extension
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityProperties {
    pub security_version: Option<u64>,
    pub is_production: Option<bool>,
}

/// Instance identity fields from the GCE extension:
///
/// ```text
/// SEQUENCE {
///   zone                UTF8String,
///   projectNumber       INTEGER,
///   projectId           UTF8String,
///   instanceId          INTEGER,
///   instanceName        UTF8String,
///   securityProperties  [0] EXPLICIT SEQUENCE {
///     securityVersion   [0] EXPLICIT INTEGER OPTIONAL,
///     isProduction      [1] EXPLICIT BOOLEAN OPTIONAL
///   } OPTIONAL
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    pub zone: String,
    pub project_number: u64,
    pub project_id: String,
    pub instance_id: u64,
    pub instance_name: String,
    pub security_properties: Option<SecurityProperties>,
}

fn malformed(what: impl Into<String>) -> CertError {
    CertError::MalformedInstanceInfo(what.into())
}

fn parse_exact<'a>(
    data: &'a [u8],
    what: &str,
) -> Result<BerObject<'a>, CertError> {
    let (rest, obj) = parse_der(data)
        .map_err(|e| malformed(format!("invalid {what}: {e}")))?;
    if !rest.is_empty() {
        return Err(malformed(format!("trailing data after {what}")));
    }
    Ok(obj)
}

/// Decodes the content of an `[n] EXPLICIT` element
fn explicit_inner<'a>(
    obj: &BerObject<'a>,
    what: &str,
) -> Result<BerObject<'a>, CertError> {
    let content = obj
        .as_slice()
        .map_err(|_| malformed(format!("{what} is not a tagged value")))?;
    parse_exact(content, what)
}

fn string_field(obj: &BerObject, what: &str) -> Result<String, CertError> {
    obj.as_str()
        .map(str::to_string)
        .map_err(|_| malformed(format!("{what} is not a string")))
}

fn integer_field(obj: &BerObject, what: &str) -> Result<u64, CertError> {
    obj.as_u64()
        .map_err(|_| malformed(format!("{what} is not an unsigned integer")))
}

fn security_properties(
    obj: &BerObject,
) -> Result<SecurityProperties, CertError> {
    if obj.header.class() != Class::ContextSpecific || obj.header.tag().0 != 0
    {
        return Err(malformed("unexpected element after instance name"));
    }

    let inner = explicit_inner(obj, "security properties")?;
    let items = inner
        .as_sequence()
        .map_err(|_| malformed("security properties is not a sequence"))?;

    let mut props = SecurityProperties::default();
    let mut last_tag = None;
    for item in items {
        if item.header.class() != Class::ContextSpecific {
            return Err(malformed("unexpected security property"));
        }
        let tag = item.header.tag().0;
        if last_tag.is_some_and(|last| last >= tag) {
            return Err(malformed("security properties out of order"));
        }
        last_tag = Some(tag);

        match tag {
            0 => {
                let value = explicit_inner(item, "security version")?;
                props.security_version =
                    Some(integer_field(&value, "security version")?);
            }
            1 => {
                let value = explicit_inner(item, "production flag")?;
                props.is_production = Some(value.as_bool().map_err(|_| {
                    malformed("production flag is not a boolean")
                })?);
            }
            t => {
                return Err(malformed(format!(
                    "unknown security property [{t}]"
                )))
            }
        }
    }

    Ok(props)
}

impl InstanceInfo {
    /// Decodes the DER value of the instance information extension
    pub fn from_der(data: &[u8]) -> Result<Self, CertError> {
        let obj = parse_exact(data, "instance information")?;
        let fields = obj
            .as_sequence()
            .map_err(|_| malformed("instance information is not a sequence"))?;

        if fields.len() < 5 || fields.len() > 6 {
            return Err(malformed(format!(
                "expected 5 or 6 fields, found {}",
                fields.len()
            )));
        }

        let security_properties =
            fields.get(5).map(security_properties).transpose()?;

        Ok(InstanceInfo {
            zone: string_field(&fields[0], "zone")?,
            project_number: integer_field(&fields[1], "project number")?,
            project_id: string_field(&fields[2], "project id")?,
            instance_id: integer_field(&fields[3], "instance id")?,
            instance_name: string_field(&fields[4], "instance name")?,
            security_properties,
        })
    }
}

/// Extracts the instance identity from a DER encoded certificate
pub fn instance_info_from_der(der: &[u8]) -> Result<InstanceInfo, CertError> {
    let (rest, cert) = parse_x509_certificate(der)
        .map_err(|e| CertError::CertificateParse(e.to_string()))?;
    if !rest.is_empty() {
        return Err(CertError::CertificateParse(
            "trailing data after certificate".to_string(),
        ));
    }

    let ext = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == GCE_INSTANCE_INFO_OID)
        .ok_or(CertError::MissingInstanceInfo)?;

    InstanceInfo::from_der(ext.value)
}

/// Extracts the instance identity from a PEM file holding exactly one
/// certificate
pub fn instance_info_from_pem(data: &[u8]) -> Result<InstanceInfo, CertError> {
    let (rest, pem) =
        parse_x509_pem(data).map_err(|e| CertError::PemDecode(e.to_string()))?;

    if pem.label != PEM_CERTIFICATE_LABEL {
        return Err(CertError::UnexpectedPemType(pem.label));
    }

    if !rest.iter().all(u8::is_ascii_whitespace) {
        return Err(CertError::TrailingData);
    }

    instance_info_from_der(&pem.contents)
}

pub fn instance_info_from_file(
    path: impl AsRef<Path>,
) -> Result<InstanceInfo, CertError> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|source| CertError::Read {
        path: path.display().to_string(),
        source,
    })?;
    instance_info_from_pem(&data)
}
