// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type as aws_any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer as PrivateKey};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::fs;
use tracing::{debug, info};

const CA_COMMON_NAME: &str = "har-proxy CA";
const CA_ORGANIZATION: &str = "har-proxy";

/// Root used to impersonate intercepted hosts. Leaf certificates are minted
/// on demand and cached per hostname.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    ca_key_pair: KeyPair,
    cache: Arc<RwLock<HashMap<String, Arc<CertifiedKey>>>>,
}

impl CertificateAuthority {
    /// Loads the CA from the specified paths, or generates a new one if they don't exist.
    /// Either way a throwaway leaf is signed before returning, so a broken
    /// key fails here rather than on the first intercepted connection.
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let ca = if cert_path.exists() && key_path.exists() {
            info!("Loading existing CA from {:?}", cert_path);
            Self::load(cert_path, key_path).await?
        } else {
            info!("Generating new CA at {:?}", cert_path);
            Self::generate_and_save(cert_path, key_path).await?
        };
        ca.self_test().context("CA cannot sign leaf certificates")?;
        Ok(ca)
    }

    /// In-memory CA that is never written to disk.
    pub fn ephemeral() -> Result<Arc<Self>> {
        let (cert_pem, key_pair) = Self::generate()?;
        let ca = Self::from_parts(cert_pem, key_pair)?;
        ca.self_test().context("CA cannot sign leaf certificates")?;
        Ok(ca)
    }

    async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .context("failed to read CA cert")?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .context("failed to read CA key")?;

        let key_pair =
            KeyPair::from_pem(&key_pem).context("failed to parse CA key pair from PEM")?;

        Self::from_parts(cert_pem, key_pair)
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let (cert_pem, key_pair) = Self::generate()?;
        let key_pem = key_pair.serialize_pem();

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(cert_path, &cert_pem).await?;
        fs::write(key_path, &key_pem).await?;

        Self::from_parts(cert_pem, key_pair)
    }

    fn generate() -> Result<(String, KeyPair)> {
        let params = Self::ca_params()?;
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert.pem(), key_pair))
    }

    fn from_parts(cert_pem: String, key_pair: KeyPair) -> Result<Arc<Self>> {
        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow::anyhow!("no certificate found in CA PEM"))?
            .context("failed to parse CA certificate")?;
        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            ca_cert_der,
            ca_key_pair: key_pair,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }))
    }

    fn self_test(&self) -> Result<()> {
        let leaf = self.mint("self-test.invalid")?;
        let signer = leaf
            .key
            .choose_scheme(&[SignatureScheme::ECDSA_NISTP256_SHA256])
            .ok_or_else(|| anyhow::anyhow!("leaf key offers no ECDSA P-256 signer"))?;
        signer
            .sign(b"har-proxy self-test")
            .map_err(|e| anyhow::anyhow!("leaf signing failed: {}", e))?;
        debug!("CA self-test passed");
        Ok(())
    }

    /// Leaf certificate for `domain`, chained to this CA.
    pub fn gen_cert_for_domain(&self, domain: &str) -> Result<Arc<CertifiedKey>> {
        let domain = domain.to_ascii_lowercase();
        {
            let cache = self
                .cache
                .read()
                .map_err(|e| anyhow::anyhow!("CA cache RwLock poisoned: {}", e))?;
            if let Some(cert) = cache.get(&domain) {
                return Ok(cert.clone());
            }
        }

        let certified_key = self.mint(&domain)?;
        debug!(%domain, "minted leaf certificate");

        let mut cache = self
            .cache
            .write()
            .map_err(|e| anyhow::anyhow!("CA cache RwLock poisoned: {}", e))?;
        // a concurrent handshake may have minted one first; keep that one
        let entry = cache.entry(domain).or_insert(certified_key);
        Ok(entry.clone())
    }

    fn mint(&self, domain: &str) -> Result<Arc<CertifiedKey>> {
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, domain);
        params.use_authority_key_identifier_extension = false;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let issuer = Issuer::new(Self::ca_params()?, &self.ca_key_pair);
        let cert = params.signed_by(&key_pair, &issuer)?;
        let key_pem = key_pair.serialize_pem();

        let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()?;
        let leaf_key_bytes = keys
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no private keys parsed from PEM"))?;
        let leaf_key_der = PrivateKey::from(leaf_key_bytes);

        let signer = aws_any_supported_type(&leaf_key_der)
            .map_err(|e| anyhow::anyhow!("failed to create leaf key signer: {}", e))?;
        let chain = vec![cert.der().clone(), self.ca_cert_der.clone()];
        Ok(Arc::new(CertifiedKey::new(chain, signer)))
    }

    pub fn get_ca_cert_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }

    pub fn cached_domains(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    fn ca_params() -> Result<CertificateParams> {
        let mut params = CertificateParams::new(vec![]).context("failed to create CA params")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORGANIZATION);
        Ok(params)
    }
}
