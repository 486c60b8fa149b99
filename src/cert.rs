//! PEM helpers: splitting a bundle into leaf and chain, validating the leaf
//! and computing its content fingerprint.

use ::pem::{EncodeConfig, LineEnding, Pem};
use sha1::{Digest, Sha1};
use x509_parser::{extensions::GeneralName, parse_x509_certificate};

use crate::error::{Error, Result};

const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Trims every line and drops blank ones.
pub fn strip_spaces(input: &[u8]) -> String {
    String::from_utf8_lossy(input)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn encode(block: &Pem) -> String {
    ::pem::encode_config(block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Splits a PEM bundle into its leaf certificate and the certificates chained after it.
///
/// Blocks that are not certificates are skipped.
/// Returns `None` if the input holds no certificate at all.
pub fn split_certs(input: &[u8]) -> Option<(String, Option<String>)> {
    let blocks = ::pem::parse_many(input).ok()?;
    let mut certificates = blocks
        .iter()
        .filter(|block| block.tag() == CERTIFICATE_LABEL)
        .map(encode);

    let leaf = certificates.next()?;
    let chain = certificates.collect::<String>();
    Some((leaf, (!chain.is_empty()).then_some(chain)))
}

/// Decodes the first PEM block, returning its DER bytes if it is a certificate.
pub fn find_certificate(input: &[u8]) -> Option<Vec<u8>> {
    let block = ::pem::parse(input).ok()?;
    (block.tag() == CERTIFICATE_LABEL).then(|| block.into_contents())
}

/// Hex encoded SHA-1 of the leaf certificate's DER bytes.
pub fn fingerprint(leaf: &[u8]) -> Option<String> {
    find_certificate(leaf).map(|der| hex::encode(Sha1::digest(der)))
}

/// Checks that the bundle starts with a parseable certificate carrying at least one DNS name.
pub fn validate_certificate(input: &[u8]) -> Result<()> {
    let block = ::pem::parse(input).map_err(|_| {
        Error::validation("can't find certificate, please verify your tls.crt section")
    })?;
    if block.tag() != CERTIFICATE_LABEL {
        return Err(Error::validation(format!(
            "can't find certificate, expected CERTIFICATE, got: {}",
            block.tag()
        )));
    }

    let (_, cert) = parse_x509_certificate(block.contents())
        .map_err(|err| Error::validation(format!("can't parse certificate: {err}")))?;
    let has_dns_name = cert
        .subject_alternative_name()
        .map_err(|err| Error::validation(format!("can't parse certificate: {err}")))?
        .map(|san| {
            san.value
                .general_names
                .iter()
                .any(|name| matches!(name, GeneralName::DNSName(_)))
        })
        .unwrap_or(false);
    if !has_dns_name {
        return Err(Error::validation("can't find dns names for certificate"));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod testdata {
    pub const LEAF_PEM: &str = include_str!("../testdata/leaf.pem");
    pub const CA_PEM: &str = include_str!("../testdata/ca.pem");
    pub const BUNDLE_PEM: &str = include_str!("../testdata/bundle.pem");
    pub const NO_DNS_PEM: &str = include_str!("../testdata/no-dns.pem");
    pub const LEAF_KEY: &str = include_str!("../testdata/leaf.key");

    pub const LEAF_FINGERPRINT: &str = "d2e91c444433a8504600ae044614a3626dc882ef";
    pub const CA_FINGERPRINT: &str = "3abd1ef7fb3080e7d03a3d8b6c2228355d984dce";
}
