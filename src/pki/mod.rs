//! Idempotent certificate issuance.
//!
//! [`ensure`] is the single entry point: CAs are generated once and then
//! reused forever; leaves are reused until their SAN set no longer covers
//! what is requested, their subject changes, or they were signed by a
//! different CA. Repeated assembly runs therefore never rotate certificates
//! that are already deployed.

use std::collections::BTreeSet;
use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;

/// First year of validity for issued certificates.
const VALID_FROM: (i32, u8, u8) = (2024, 1, 1);
/// Last year of validity for issued certificates.
const VALID_UNTIL: (i32, u8, u8) = (2124, 1, 1);

/// PEM-encoded certificate and private key, persisted with the owning
/// component's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertMaterial {
    pub cert: String,
    pub key: String,
}

/// What a certificate will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertUsage {
    Ca,
    Server,
    Client,
    ServerClient,
}

impl CertUsage {
    fn needs_sans(self) -> bool {
        matches!(self, CertUsage::Server | CertUsage::ServerClient)
    }

    fn extended_key_usages(self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            CertUsage::Ca => Vec::new(),
            CertUsage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            CertUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
            CertUsage::ServerClient => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        }
    }
}

/// Certificate issuance failures.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate `{subject}` needs a signing CA")]
    MissingCa { subject: String },

    #[error("server certificate `{subject}` needs at least one IP or DNS SAN")]
    NoSans { subject: String },

    #[error("failed to generate certificate `{subject}`")]
    Generate {
        subject: String,
        #[source]
        source: rcgen::Error,
    },

    #[error("failed to parse certificate material for `{subject}`: {message}")]
    Parse { subject: String, message: String },
}

/// Parameters of one [`ensure`] call.
#[derive(Debug, Clone, Copy)]
pub struct CertRequest<'a> {
    pub subject: &'a str,
    pub usage: CertUsage,
    /// Signing CA; `None` only for [`CertUsage::Ca`].
    pub ca: Option<&'a CertMaterial>,
    pub ip_sans: &'a [IpAddr],
    pub dns_sans: &'a [String],
}

impl<'a> CertRequest<'a> {
    /// Request for a self-signed CA.
    pub fn ca(subject: &'a str) -> Self {
        CertRequest {
            subject,
            usage: CertUsage::Ca,
            ca: None,
            ip_sans: &[],
            dns_sans: &[],
        }
    }

    /// Request for a leaf signed by `ca`.
    pub fn leaf(
        subject: &'a str,
        usage: CertUsage,
        ca: &'a CertMaterial,
        ip_sans: &'a [IpAddr],
        dns_sans: &'a [String],
    ) -> Self {
        CertRequest {
            subject,
            usage,
            ca: Some(ca),
            ip_sans,
            dns_sans,
        }
    }
}

/// Return `existing` when it still satisfies `req`, otherwise issue anew.
pub fn ensure(req: &CertRequest<'_>, existing: Option<&CertMaterial>) -> Result<CertMaterial, CertError> {
    if req.usage == CertUsage::Ca {
        if let Some(existing) = existing {
            parse_material(req.subject, existing)?;
            tracing::debug!("reusing CA `{}`", req.subject);
            return Ok(existing.clone());
        }
        tracing::info!("generating CA `{}`", req.subject);
        return generate_ca(req.subject);
    }

    let ca = req.ca.ok_or_else(|| CertError::MissingCa {
        subject: req.subject.to_string(),
    })?;
    if req.usage.needs_sans() && req.ip_sans.is_empty() && req.dns_sans.is_empty() {
        return Err(CertError::NoSans {
            subject: req.subject.to_string(),
        });
    }

    if let Some(existing) = existing {
        match leaf_reusable(req, ca, existing)? {
            None => {
                tracing::debug!("reusing certificate `{}`", req.subject);
                return Ok(existing.clone());
            }
            Some(reason) => {
                tracing::info!("reissuing certificate `{}`: {}", req.subject, reason);
            }
        }
    } else {
        tracing::info!("issuing certificate `{}`", req.subject);
    }

    issue_leaf(req, ca)
}

fn generation_error(subject: &str) -> impl FnOnce(rcgen::Error) -> CertError + '_ {
    move |source| CertError::Generate {
        subject: subject.to_string(),
        source,
    }
}

fn base_params(subject: &str, sans: Vec<String>) -> Result<CertificateParams, CertError> {
    let mut params = CertificateParams::new(sans).map_err(generation_error(subject))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;
    params.not_before = rcgen::date_time_ymd(VALID_FROM.0, VALID_FROM.1, VALID_FROM.2);
    params.not_after = rcgen::date_time_ymd(VALID_UNTIL.0, VALID_UNTIL.1, VALID_UNTIL.2);
    Ok(params)
}

fn generate_ca(subject: &str) -> Result<CertMaterial, CertError> {
    let mut params = base_params(subject, Vec::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let key = KeyPair::generate().map_err(generation_error(subject))?;
    let cert = params.self_signed(&key).map_err(generation_error(subject))?;

    Ok(CertMaterial {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

fn issue_leaf(req: &CertRequest<'_>, ca: &CertMaterial) -> Result<CertMaterial, CertError> {
    let sans: Vec<String> = req
        .ip_sans
        .iter()
        .map(IpAddr::to_string)
        .chain(req.dns_sans.iter().cloned())
        .collect();

    let mut params = base_params(req.subject, sans)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = req.usage.extended_key_usages();
    params.use_authority_key_identifier_extension = true;

    let ca_key = KeyPair::from_pem(&ca.key).map_err(generation_error(req.subject))?;
    let ca_params =
        CertificateParams::from_ca_cert_pem(&ca.cert).map_err(generation_error(req.subject))?;
    let issuer = ca_params
        .self_signed(&ca_key)
        .map_err(generation_error(req.subject))?;

    let key = KeyPair::generate().map_err(generation_error(req.subject))?;
    let cert = params
        .signed_by(&key, &issuer, &ca_key)
        .map_err(generation_error(req.subject))?;

    Ok(CertMaterial {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

fn parse_pem(subject: &str, pem: &str) -> Result<Pem, CertError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).map_err(|e| CertError::Parse {
        subject: subject.to_string(),
        message: e.to_string(),
    })?;
    Ok(pem)
}

fn parse_cert<'p>(subject: &str, pem: &'p Pem) -> Result<X509Certificate<'p>, CertError> {
    pem.parse_x509().map_err(|e| CertError::Parse {
        subject: subject.to_string(),
        message: e.to_string(),
    })
}

fn parse_material(subject: &str, material: &CertMaterial) -> Result<(), CertError> {
    let pem = parse_pem(subject, &material.cert)?;
    parse_cert(subject, &pem)?;
    KeyPair::from_pem(&material.key).map_err(|e| CertError::Parse {
        subject: subject.to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

/// SANs recorded in a certificate.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SanSet {
    pub ips: BTreeSet<IpAddr>,
    pub dns: BTreeSet<String>,
}

impl SanSet {
    /// Whether every requested SAN is present.
    pub fn covers(&self, ips: &[IpAddr], dns: &[String]) -> bool {
        ips.iter().all(|ip| self.ips.contains(ip)) && dns.iter().all(|d| self.dns.contains(d))
    }
}

fn san_set(cert: &X509Certificate<'_>) -> SanSet {
    let mut set = SanSet::default();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => {
                    set.dns.insert(dns.to_string());
                }
                GeneralName::IPAddress(bytes) => {
                    if let Ok(v4) = <[u8; 4]>::try_from(*bytes) {
                        set.ips.insert(IpAddr::from(v4));
                    } else if let Ok(v6) = <[u8; 16]>::try_from(*bytes) {
                        set.ips.insert(IpAddr::from(v6));
                    }
                }
                _ => {}
            }
        }
    }
    set
}

/// Read the SANs out of PEM certificate material.
pub fn sans_of(subject: &str, material: &CertMaterial) -> Result<SanSet, CertError> {
    let pem = parse_pem(subject, &material.cert)?;
    let cert = parse_cert(subject, &pem)?;
    Ok(san_set(&cert))
}

/// `None` if the leaf can be kept, otherwise why it must be reissued.
fn leaf_reusable(
    req: &CertRequest<'_>,
    ca: &CertMaterial,
    existing: &CertMaterial,
) -> Result<Option<&'static str>, CertError> {
    let Ok(leaf_pem) = parse_pem(req.subject, &existing.cert) else {
        return Ok(Some("existing certificate is unreadable"));
    };
    let Ok(leaf) = parse_cert(req.subject, &leaf_pem) else {
        return Ok(Some("existing certificate is unreadable"));
    };
    if KeyPair::from_pem(&existing.key).is_err() {
        return Ok(Some("existing key is unreadable"));
    }

    let ca_pem = parse_pem(req.subject, &ca.cert)?;
    let ca_cert = parse_cert(req.subject, &ca_pem)?;

    let common_name = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok());
    if common_name != Some(req.subject) {
        return Ok(Some("subject changed"));
    }
    if leaf.issuer().as_raw() != ca_cert.subject().as_raw()
        || leaf.verify_signature(Some(ca_cert.public_key())).is_err()
    {
        return Ok(Some("signed by a different CA"));
    }
    if !san_set(&leaf).covers(req.ip_sans, req.dns_sans) {
        return Ok(Some("requested SANs are not covered"));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ca_generated_once() {
        let ca = ensure(&CertRequest::ca("stagehand-ca"), None).unwrap();
        let again = ensure(&CertRequest::ca("stagehand-ca"), Some(&ca)).unwrap();
        assert_eq!(ca, again);
    }

    #[test]
    fn test_leaf_reused_then_reissued_on_new_san() {
        let ca = ensure(&CertRequest::ca("stagehand-ca"), None).unwrap();
        let ips = [ip("172.30.0.1")];
        let dns = vec!["registry.local".to_string()];

        let req = CertRequest::leaf("registry", CertUsage::Server, &ca, &ips, &dns);
        let first = ensure(&req, None).unwrap();
        let second = ensure(&req, Some(&first)).unwrap();
        assert_eq!(first, second);

        let more_dns = vec!["registry.local".to_string(), "zot.local".to_string()];
        let grown = CertRequest::leaf("registry", CertUsage::Server, &ca, &ips, &more_dns);
        let ca_before = ca.clone();
        let third = ensure(&grown, Some(&second)).unwrap();
        assert_ne!(third.key, second.key);
        assert_ne!(third.cert, second.cert);

        let sans = sans_of("registry", &third).unwrap();
        assert!(sans.covers(&ips, &more_dns));
        assert_eq!(ca, ca_before);

        // The new leaf is accepted as-is against the unchanged CA.
        assert_eq!(ensure(&grown, Some(&third)).unwrap(), third);
    }

    #[test]
    fn test_subset_request_keeps_leaf() {
        let ca = ensure(&CertRequest::ca("ca"), None).unwrap();
        let ips = [ip("10.0.0.1"), ip("10.0.0.2")];
        let leaf = ensure(&CertRequest::leaf("svc", CertUsage::Server, &ca, &ips, &[]), None).unwrap();

        let fewer = [ip("10.0.0.2")];
        let kept = ensure(&CertRequest::leaf("svc", CertUsage::Server, &ca, &fewer, &[]), Some(&leaf))
            .unwrap();
        assert_eq!(kept, leaf);
    }

    #[test]
    fn test_leaf_reissued_for_different_ca() {
        let ca_a = ensure(&CertRequest::ca("ca"), None).unwrap();
        let ca_b = ensure(&CertRequest::ca("ca"), None).unwrap();
        let ips = [ip("10.0.0.1")];

        let leaf = ensure(&CertRequest::leaf("svc", CertUsage::Server, &ca_a, &ips, &[]), None).unwrap();
        let moved = ensure(&CertRequest::leaf("svc", CertUsage::Server, &ca_b, &ips, &[]), Some(&leaf))
            .unwrap();
        assert_ne!(moved, leaf);
    }

    #[test]
    fn test_leaf_requires_ca_and_sans() {
        let err = ensure(
            &CertRequest {
                subject: "svc",
                usage: CertUsage::Server,
                ca: None,
                ip_sans: &[],
                dns_sans: &[],
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CertError::MissingCa { .. }));

        let ca = ensure(&CertRequest::ca("ca"), None).unwrap();
        let err = ensure(&CertRequest::leaf("svc", CertUsage::Server, &ca, &[], &[]), None)
            .unwrap_err();
        assert!(matches!(err, CertError::NoSans { .. }));

        assert!(ensure(&CertRequest::leaf("cli", CertUsage::Client, &ca, &[], &[]), None).is_ok());
    }

    #[test]
    fn test_garbage_ca_is_an_error() {
        let bogus = CertMaterial {
            cert: "not a pem".to_string(),
            key: "nope".to_string(),
        };
        assert!(matches!(
            ensure(&CertRequest::ca("ca"), Some(&bogus)),
            Err(CertError::Parse { .. })
        ));
    }
}
