use std::sync::{Arc, LazyLock};
use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, SubjectConfig};
use crate::error::{ProvisionError, Result};
use crate::key_store::{KeyStore, PrivateKey};
use crate::storage::{Artifact, CertStore};

static CODE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[?&])code=([0-9A-Fa-f]*)").expect("code pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueOutcome {
    Issued,
    AlreadyIssued,
}

/// Pull the OAuth code out of whatever the operator pasted: either the full
/// redirect URL (`...?code=<hex>`) or the bare code.
pub fn normalize_authorization_code(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let code = match CODE_PARAM.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    };
    if code.is_empty() {
        return Err(ProvisionError::InvalidAuthorizationCode);
    }
    Ok(code)
}

/// URL the operator visits to log in and obtain an authorization code.
pub fn authorize_url(config: &Config) -> Result<String, url::ParseError> {
    let login = &config.login;
    let url = url::Url::parse_with_params(
        &format!("{}oauth/authorize", login.base_url),
        &[
            ("client_id", login.client_id.as_str()),
            ("redirect_uri", login.redirect_uri().as_str()),
            ("response_type", "code"),
        ],
    )?;
    Ok(url.to_string())
}

/// PEM-encoded CSR for `key`, signed with SHA-256.
pub fn build_csr(key: &PrivateKey, subject: &SubjectConfig) -> Result<String> {
    let key_der = key.to_pkcs8_der()?;
    let key_pair = KeyPair::try_from(key_der.as_slice()).map_err(|e| {
        ProvisionError::Certificate(format!("Failed to create KeyPair from RSA key: {}", e))
    })?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, subject.country.clone());
    dn.push(DnType::StateOrProvinceName, subject.state.clone());
    dn.push(DnType::LocalityName, subject.locality.clone());
    dn.push(DnType::OrganizationName, subject.organization.clone());
    dn.push(DnType::CommonName, subject.common_name.clone());

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| ProvisionError::Certificate(format!("Failed to generate CSR: {}", e)))?;
    csr.pem()
        .map_err(|e| ProvisionError::Certificate(format!("Failed to encode CSR as PEM: {}", e)))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct PairingRequest<'a> {
    remote_signs_app_certificate_signing_request: &'a str,
}

#[derive(Debug, Deserialize)]
struct PairingResponse {
    remote_signs_app_certificate: Option<String>,
    local_signs_remote_certificate: Option<String>,
}

/// Obtains the application certificate from the Lutron login service.
#[derive(Debug, Clone)]
pub struct CertificateIssuer {
    config: Arc<Config>,
    store: Arc<CertStore>,
    keys: KeyStore,
    http: reqwest::Client,
}

impl CertificateIssuer {
    pub fn new(config: Arc<Config>, store: Arc<CertStore>, keys: KeyStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.login.timeout_secs))
            .build()
            .map_err(|e| ProvisionError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            store,
            keys,
            http,
        })
    }

    /// Run the OAuth exchange and pairing request, saving the signed
    /// certificate. Does nothing once a certificate is on disk.
    pub async fn issue_certificate(&self, raw_redirect_input: &str) -> Result<IssueOutcome> {
        if self.store.exists(Artifact::Certificate) {
            info!(
                "Certificate already present at {}, skipping issuance",
                self.store.path(Artifact::Certificate).display()
            );
            return Ok(IssueOutcome::AlreadyIssued);
        }

        let code = normalize_authorization_code(raw_redirect_input)?;

        // Key generation is CPU bound
        let keys = self.keys.clone();
        let subject = self.config.subject.clone();
        let csr_pem = tokio::task::spawn_blocking(move || {
            let key = keys.get_or_create_key()?;
            build_csr(&key, &subject)
        })
        .await
        .map_err(|e| ProvisionError::Certificate(format!("CSR task failed: {}", e)))??;

        let access_token = self.exchange_code(&code).await?;
        info!("Authorization code exchanged for access token");

        let (app_cert, remote_cert) = self.submit_csr(&csr_pem, &access_token).await?;

        let mut bundle = app_cert;
        if !bundle.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push_str(&remote_cert);

        if !self.store.write_new(Artifact::Certificate, bundle.as_bytes())? {
            warn!("Certificate appeared while pairing was in flight; keeping the existing one");
            return Ok(IssueOutcome::AlreadyIssued);
        }
        info!(
            "Signed certificate saved to {}",
            self.store.path(Artifact::Certificate).display()
        );
        Ok(IssueOutcome::Issued)
    }

    async fn exchange_code(&self, code: &str) -> Result<String> {
        let login = &self.config.login;
        let redirect_uri = login.redirect_uri();
        let params = [
            ("code", code),
            ("client_id", login.client_id.as_str()),
            ("client_secret", login.client_secret.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];

        let url = login.token_url();
        let resp = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ProvisionError::TokenExchange(format!("request to {} failed: {}", url, e)))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProvisionError::TokenExchange(format!("failed to read response: {}", e)))?;

        let token: TokenResponse = serde_json::from_str(&body).map_err(|_| {
            ProvisionError::TokenExchange(format!("unexpected response from token endpoint (HTTP {})", status))
        })?;

        if let Some(error) = token.error {
            return Err(ProvisionError::TokenExchange(
                token.error_description.unwrap_or(error),
            ));
        }

        match (token.token_type.as_deref(), token.access_token) {
            (Some(kind), Some(access)) if kind.eq_ignore_ascii_case("bearer") && !access.is_empty() => {
                Ok(access)
            }
            (kind, _) => Err(ProvisionError::TokenExchange(format!(
                "Received invalid token (type {}). Try generating a new code (one time use).",
                kind.unwrap_or("missing")
            ))),
        }
    }

    async fn submit_csr(&self, csr_pem: &str, access_token: &str) -> Result<(String, String)> {
        let url = self.config.login.pairing_url();
        let request = PairingRequest {
            remote_signs_app_certificate_signing_request: csr_pem,
        };

        let resp = self
            .http
            .post(&url)
            .header("X-DeviceType", &self.config.login.device_type)
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProvisionError::Pairing(format!("request to {} failed: {}", url, e)))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProvisionError::Pairing(format!("failed to read response: {}", e)))?;

        let pairing: PairingResponse = serde_json::from_str(&body).map_err(|_| {
            ProvisionError::Pairing(format!("unexpected response from pairing endpoint (HTTP {})", status))
        })?;

        let app_cert = require_pem(pairing.remote_signs_app_certificate, "remote_signs_app_certificate")?;
        let remote_cert = require_pem(
            pairing.local_signs_remote_certificate,
            "local_signs_remote_certificate",
        )?;
        Ok((app_cert, remote_cert))
    }
}

fn require_pem(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(pem) if pem.contains("-----BEGIN") && pem.is_ascii() => Ok(pem),
        Some(_) => Err(ProvisionError::Pairing(format!("{} is not a PEM certificate", field))),
        None => Err(ProvisionError::Pairing(format!("response is missing {}", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_store;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use x509_parser::prelude::FromDer;

    const APP_CERT: &str = "-----BEGIN CERTIFICATE-----\nQVBQ\n-----END CERTIFICATE-----\n";
    const REMOTE_CERT: &str = "-----BEGIN CERTIFICATE-----\nUkVNT1RF\n-----END CERTIFICATE-----\n";

    fn issuer_for(server: &MockServer, dir: &std::path::Path) -> (CertificateIssuer, Arc<CertStore>) {
        let mut config = Config::default();
        config.login.base_url = format!("{}/", server.uri());
        let config = Arc::new(config);
        let store = Arc::new(test_store(dir));
        let keys = KeyStore::new(store.clone());
        let issuer = CertificateIssuer::new(config, store.clone(), keys).unwrap();
        (issuer, store)
    }

    async fn mount_token(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn code_from_redirect_url() {
        assert_eq!(
            normalize_authorization_code("https://device-login.lutron.com/lutron_app_oauth_redirect?code=ab12cd\n").unwrap(),
            "ab12cd"
        );
    }

    #[test]
    fn code_ignores_trailing_query_params() {
        assert_eq!(
            normalize_authorization_code("https://example.com/cb?code=deadbeef&state=xyz").unwrap(),
            "deadbeef"
        );
    }

    #[test]
    fn code_param_is_not_matched_inside_other_names() {
        assert_eq!(
            normalize_authorization_code("https://example.com/cb?error_code=1&code=ab").unwrap(),
            "ab"
        );
        assert_eq!(normalize_authorization_code("code=ab12cd").unwrap(), "ab12cd");
    }

    #[test]
    fn bare_code_is_unchanged() {
        assert_eq!(normalize_authorization_code("ab12cd").unwrap(), "ab12cd");
        assert_eq!(normalize_authorization_code("  ab12cd \r\n").unwrap(), "ab12cd");
    }

    #[test]
    fn blank_code_is_rejected() {
        for input in ["", "   ", "\n", "https://example.com/cb?code="] {
            assert!(matches!(
                normalize_authorization_code(input),
                Err(ProvisionError::InvalidAuthorizationCode)
            ));
        }
    }

    #[test]
    fn authorize_url_carries_client_and_redirect() {
        let url = url::Url::parse(&authorize_url(&Config::default()).unwrap()).unwrap();
        assert_eq!(url.path(), "/oauth/authorize");
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], Config::default().login.client_id);
        assert_eq!(
            pairs["redirect_uri"],
            "https://device-login.lutron.com/lutron_app_oauth_redirect"
        );
    }

    #[test]
    fn csr_has_fixed_subject_and_sha256() {
        let key = PrivateKey::generate().unwrap();
        let csr = build_csr(&key, &SubjectConfig::default()).unwrap();
        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));

        let (_, pem) = x509_parser::pem::parse_x509_pem(csr.as_bytes()).unwrap();
        let (_, req) =
            x509_parser::certification_request::X509CertificationRequest::from_der(&pem.contents)
                .unwrap();
        let subject = &req.certification_request_info.subject;
        let cn = subject.iter_common_name().next().unwrap().as_str().unwrap();
        let org = subject.iter_organization().next().unwrap().as_str().unwrap();
        let locality = subject.iter_locality().next().unwrap().as_str().unwrap();
        let country = subject.iter_country().next().unwrap().as_str().unwrap();
        assert_eq!(cn, "Lutron Caseta App");
        assert_eq!(org, "Lutron Electronics Co., Inc.");
        assert_eq!(locality, "Coopersburg");
        assert_eq!(country, "US");
        // sha256WithRSAEncryption
        assert_eq!(
            req.signature_algorithm.algorithm.to_id_string(),
            "1.2.840.113549.1.1.11"
        );
    }

    #[tokio::test]
    async fn issues_and_saves_certificate_bundle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("code=deadbeef"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "token_type": "bearer"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/remotepairing/application/user"))
            .and(header_regex("X-DeviceType", "^Caseta,RA2Select$"))
            .and(header("Authorization", "Bearer tok"))
            .and(body_string_contains("remote_signs_app_certificate_signing_request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "remote_signs_app_certificate": APP_CERT,
                "local_signs_remote_certificate": REMOTE_CERT,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (issuer, store) = issuer_for(&server, tmp.path());

        let outcome = issuer
            .issue_certificate("https://example.com/cb?code=deadbeef")
            .await
            .unwrap();
        assert_eq!(outcome, IssueOutcome::Issued);

        let saved = std::fs::read_to_string(store.path(Artifact::Certificate)).unwrap();
        assert_eq!(saved, format!("{}{}", APP_CERT, REMOTE_CERT));
        assert!(store.exists(Artifact::PrivateKey));
        assert!(!store.exists(Artifact::CaBundle));
    }

    #[tokio::test]
    async fn existing_certificate_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (issuer, store) = issuer_for(&server, tmp.path());
        store.write(Artifact::Certificate, APP_CERT.as_bytes()).unwrap();

        let outcome = issuer.issue_certificate("").await.unwrap();
        assert_eq!(outcome, IssueOutcome::AlreadyIssued);
        assert!(!store.exists(Artifact::PrivateKey));
    }

    #[tokio::test]
    async fn invalid_code_leaves_no_key() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let (issuer, store) = issuer_for(&server, tmp.path());

        let err = issuer.issue_certificate("  \n").await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidAuthorizationCode));
        assert!(!store.exists(Artifact::PrivateKey));
    }

    #[tokio::test]
    async fn token_error_carries_description() {
        let server = MockServer::start().await;
        mount_token(
            &server,
            json!({"error": "invalid_grant", "error_description": "The provided authorization grant is invalid"}),
        )
        .await;
        Mock::given(path("/api/v1/remotepairing/application/user"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (issuer, store) = issuer_for(&server, tmp.path());

        match issuer.issue_certificate("deadbeef").await {
            Err(ProvisionError::TokenExchange(msg)) => {
                assert_eq!(msg, "The provided authorization grant is invalid")
            }
            other => panic!("expected TokenExchange, got {:?}", other),
        }
        assert!(!store.exists(Artifact::Certificate));
    }

    #[tokio::test]
    async fn non_bearer_token_is_rejected() {
        let server = MockServer::start().await;
        mount_token(&server, json!({"access_token": "tok", "token_type": "mac"})).await;

        let tmp = tempfile::tempdir().unwrap();
        let (issuer, _store) = issuer_for(&server, tmp.path());

        let err = issuer.issue_certificate("deadbeef").await.unwrap_err();
        assert!(matches!(err, ProvisionError::TokenExchange(_)));
    }

    #[tokio::test]
    async fn incomplete_pairing_response_is_an_error() {
        let server = MockServer::start().await;
        mount_token(&server, json!({"access_token": "tok", "token_type": "bearer"})).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/remotepairing/application/user"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"remote_signs_app_certificate": APP_CERT})),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (issuer, store) = issuer_for(&server, tmp.path());

        let err = issuer.issue_certificate("deadbeef").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Pairing(_)));
        assert!(!store.exists(Artifact::Certificate));
        assert!(store.exists(Artifact::PrivateKey));
    }

    #[tokio::test]
    async fn non_json_pairing_response_is_an_error() {
        let server = MockServer::start().await;
        mount_token(&server, json!({"access_token": "tok", "token_type": "bearer"})).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/remotepairing/application/user"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>Bad Gateway</html>"))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (issuer, _store) = issuer_for(&server, tmp.path());

        let err = issuer.issue_certificate("deadbeef").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Pairing(_)));
    }
}
