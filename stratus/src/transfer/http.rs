use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use http::{uri::Scheme, Uri};
use native_tls::{Certificate, Protocol, TlsConnector};

const BEGIN_CERT: &str = "-----BEGIN CERTIFICATE-----";
const END_CERT: &str = "-----END CERTIFICATE-----";

/// Builds the TLS connector shared by the HTTP agent and the MQTT transport:
/// TLS 1.2 minimum, trusting the roots from the configured CA bundle.
pub(crate) fn tls_connector(ca_bundle: &Path) -> Result<TlsConnector> {
    let pem = fs::read_to_string(ca_bundle)
        .with_context(|| format!("unable to read CA bundle {}", ca_bundle.display()))?;

    let mut builder = TlsConnector::builder();
    builder.min_protocol_version(Some(Protocol::Tlsv12));

    let mut added = 0;
    for block in pem_blocks(&pem) {
        let certificate = Certificate::from_pem(block.as_bytes())
            .with_context(|| format!("invalid certificate in {}", ca_bundle.display()))?;
        builder.add_root_certificate(certificate);
        added += 1;
    }
    if added == 0 {
        bail!("no certificates found in {}", ca_bundle.display());
    }

    builder.build().context("unable to build TLS connector")
}

// native_tls parses one certificate per call, so the bundle is split on the
// PEM armour lines first.
fn pem_blocks(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find(BEGIN_CERT) {
        let Some(end) = rest[start..].find(END_CERT) else {
            break;
        };
        let end = start + end + END_CERT.len();
        blocks.push(rest[start..end].to_owned());
        rest = &rest[end..];
    }
    blocks
}

/// Builds the blocking HTTP agent used for file transfers.
pub(crate) fn build_agent(ca_bundle: Option<&Path>) -> Result<ureq::Agent> {
    let mut builder = ureq::AgentBuilder::new().timeout_connect(Duration::from_secs(30));
    if let Some(bundle) = ca_bundle {
        builder = builder.tls_connector(Arc::new(tls_connector(bundle)?));
    }
    Ok(builder.build())
}

/// URL of a file endpoint; HTTPS whenever a CA bundle is configured.
pub(crate) fn file_endpoint(secure: bool, host: &str, file_id: &str) -> Result<String> {
    let scheme = if secure { Scheme::HTTPS } else { Scheme::HTTP };
    let uri = Uri::builder()
        .scheme(scheme)
        .authority(host)
        .path_and_query(format!("/file/{file_id}"))
        .build()
        .with_context(|| format!("unable to build file URL for host {host:?}"))?;
    Ok(uri.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_scheme_follows_bundle_presence() {
        assert_eq!(
            file_endpoint(true, "cloud.example", "F1").unwrap(),
            "https://cloud.example/file/F1"
        );
        assert_eq!(
            file_endpoint(false, "cloud.example:8080", "F2").unwrap(),
            "http://cloud.example:8080/file/F2"
        );
    }

    #[test]
    fn endpoint_rejects_invalid_hosts() {
        assert!(file_endpoint(false, "not a host", "F1").is_err());
    }

    #[test]
    fn pem_bundle_splits_into_blocks() {
        let bundle = format!(
            "{BEGIN_CERT}\nAAAA\n{END_CERT}\nsome comment\n{BEGIN_CERT}\nBBBB\n{END_CERT}\n"
        );
        let blocks = pem_blocks(&bundle);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("AAAA"));
        assert!(blocks[1].contains("BBBB"));
    }
}
