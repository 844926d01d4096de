//! Deployment of TLS secrets for control plane components.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use tracing::{debug, info, warn};

use crate::client::{to_dynamic, SeedClient};
use crate::error::{is_not_found, Error};

/// Key of the CA certificate in certificate secrets.
pub const DATA_KEY_CA_CERTIFICATE: &str = "ca.crt";
/// Key of the CA private key in the CA secret.
pub const DATA_KEY_CA_PRIVATE_KEY: &str = "ca.key";
/// Key of the certificate in certificate secrets.
pub const DATA_KEY_CERTIFICATE: &str = "tls.crt";
/// Key of the private key in certificate secrets.
pub const DATA_KEY_PRIVATE_KEY: &str = "tls.key";

/// Deploys the secrets a control plane needs and removes them again.
#[async_trait::async_trait]
pub trait SecretsDeployer: Send + Sync {
    /// Ensures all secrets exist in `namespace` and returns them keyed by name.
    async fn deploy(&self, namespace: &str) -> anyhow::Result<BTreeMap<String, Secret>>;

    /// Deletes all secrets from `namespace`. Missing secrets are ignored.
    async fn delete(&self, namespace: &str) -> anyhow::Result<()>;
}

/// What a certificate is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateKind {
    /// TLS server.
    Server,
    /// TLS client.
    Client,
}

/// A certificate to be stored in its own secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateSecretConfig {
    /// Name of the secret.
    pub name: String,
    /// Common name of the certificate.
    pub common_name: String,
    /// Organizations of the subject.
    pub organizations: Vec<String>,
    /// DNS names for server certificates.
    pub dns_names: Vec<String>,
    /// Usage.
    pub kind: CertificateKind,
}

impl CertificateSecretConfig {
    /// A server certificate valid for `dns_names`.
    pub fn server(name: &str, common_name: &str, dns_names: &[&str]) -> Self {
        CertificateSecretConfig {
            name: name.to_owned(),
            common_name: common_name.to_owned(),
            organizations: Vec::new(),
            dns_names: dns_names.iter().map(|s| (*s).to_owned()).collect(),
            kind: CertificateKind::Server,
        }
    }

    /// A client certificate.
    pub fn client(name: &str, common_name: &str, organizations: &[&str]) -> Self {
        CertificateSecretConfig {
            name: name.to_owned(),
            common_name: common_name.to_owned(),
            organizations: organizations.iter().map(|s| (*s).to_owned()).collect(),
            dns_names: Vec::new(),
            kind: CertificateKind::Client,
        }
    }

    fn params(&self) -> CertificateParams {
        let mut params = CertificateParams::new(self.dns_names.clone());
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, self.common_name.clone());
        for organization in &self.organizations {
            name.push(DnType::OrganizationName, organization.clone());
        }
        params.distinguished_name = name;
        params.extended_key_usages = vec![match self.kind {
            CertificateKind::Server => ExtendedKeyUsagePurpose::ServerAuth,
            CertificateKind::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }];
        params
    }
}

/// Creates a CA secret and certificate secrets signed by it. Secrets that
/// already exist are reused as they are.
pub struct CertificateSecretsDeployer {
    client: Arc<dyn SeedClient>,
    ca_name: String,
    certificates: Vec<CertificateSecretConfig>,
}

impl CertificateSecretsDeployer {
    /// Creates a deployer with a CA stored in the secret `ca_name`.
    pub fn new(
        client: Arc<dyn SeedClient>,
        ca_name: &str,
        certificates: Vec<CertificateSecretConfig>,
    ) -> Self {
        CertificateSecretsDeployer {
            client,
            ca_name: ca_name.to_owned(),
            certificates,
        }
    }

    async fn ensure_ca(&self, namespace: &str) -> anyhow::Result<(Secret, Certificate)> {
        if let Some(existing) = self.client.get_secret(namespace, &self.ca_name).await? {
            let cert = data_string(&existing, DATA_KEY_CA_CERTIFICATE)?;
            let key = data_string(&existing, DATA_KEY_CA_PRIVATE_KEY)?;
            let params = CertificateParams::from_ca_cert_pem(&cert, KeyPair::from_pem(&key)?)?;
            debug!(name = %self.ca_name, %namespace, "Reusing CA secret");
            return Ok((existing, Certificate::from_params(params)?));
        }

        let mut params = CertificateParams::new(Vec::new());
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, self.ca_name.clone());
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = Certificate::from_params(params)?;

        let mut data = BTreeMap::new();
        data.insert(
            DATA_KEY_CA_CERTIFICATE.to_owned(),
            ByteString(ca.serialize_pem()?.into_bytes()),
        );
        data.insert(
            DATA_KEY_CA_PRIVATE_KEY.to_owned(),
            ByteString(ca.serialize_private_key_pem().into_bytes()),
        );
        let secret = self.secret(namespace, &self.ca_name, data);
        self.client.apply(&to_dynamic(&secret)?).await?;
        info!(name = %self.ca_name, %namespace, "Created CA secret");
        Ok((secret, ca))
    }

    async fn ensure_certificate(
        &self,
        namespace: &str,
        config: &CertificateSecretConfig,
        ca: &Certificate,
        ca_pem: &ByteString,
    ) -> anyhow::Result<Secret> {
        if let Some(existing) = self.client.get_secret(namespace, &config.name).await? {
            debug!(name = %config.name, %namespace, "Reusing certificate secret");
            return Ok(existing);
        }
        let certificate = Certificate::from_params(config.params())?;
        let mut data = BTreeMap::new();
        data.insert(DATA_KEY_CA_CERTIFICATE.to_owned(), ca_pem.clone());
        data.insert(
            DATA_KEY_CERTIFICATE.to_owned(),
            ByteString(certificate.serialize_pem_with_signer(ca)?.into_bytes()),
        );
        data.insert(
            DATA_KEY_PRIVATE_KEY.to_owned(),
            ByteString(certificate.serialize_private_key_pem().into_bytes()),
        );
        let secret = self.secret(namespace, &config.name, data);
        self.client.apply(&to_dynamic(&secret)?).await?;
        info!(name = %config.name, %namespace, "Created certificate secret");
        Ok(secret)
    }

    fn secret(&self, namespace: &str, name: &str, data: BTreeMap<String, ByteString>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_owned()),
            ..Default::default()
        }
    }
}

fn data_string(secret: &Secret, key: &str) -> anyhow::Result<String> {
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| Error::invalid(format!("data.{}", key), "Required", "key missing in secret"))?;
    Ok(String::from_utf8(value.0.clone())?)
}

#[async_trait::async_trait]
impl SecretsDeployer for CertificateSecretsDeployer {
    async fn deploy(&self, namespace: &str) -> anyhow::Result<BTreeMap<String, Secret>> {
        let (ca_secret, ca) = self.ensure_ca(namespace).await?;
        let ca_pem = ca_secret
            .data
            .as_ref()
            .and_then(|data| data.get(DATA_KEY_CA_CERTIFICATE))
            .cloned()
            .ok_or_else(|| Error::invalid("data.ca.crt", "Required", "CA secret has no certificate"))?;

        let mut secrets = BTreeMap::new();
        for config in &self.certificates {
            let secret = self.ensure_certificate(namespace, config, &ca, &ca_pem).await?;
            secrets.insert(config.name.clone(), secret);
        }
        secrets.insert(self.ca_name.clone(), ca_secret);
        Ok(secrets)
    }

    async fn delete(&self, namespace: &str) -> anyhow::Result<()> {
        let names = self
            .certificates
            .iter()
            .map(|c| c.name.as_str())
            .chain(std::iter::once(self.ca_name.as_str()));
        for name in names {
            match self.client.delete(Some(namespace), "v1", "Secret", name).await {
                Ok(()) => debug!(%name, %namespace, "Deleted secret"),
                Err(e) if is_not_found(&e) => warn!(%name, %namespace, "Secret already gone"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
