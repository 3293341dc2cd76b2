use std::path::Path;
use std::sync::Arc;

use crate::cert_issuer::{self, CertificateIssuer, IssueOutcome};
use crate::config::Config;
use crate::error::{ProvisionError, Result};
use crate::key_store::KeyStore;
use crate::progress::{ProvisioningState, ProvisioningStep};
use crate::storage::{ArtifactStatus, CertStore};
use crate::trust_bootstrap::{BridgeInfo, TrustBootstrapper};

/// Everything the CLI and web wizard call into.
#[derive(Debug, Clone)]
pub struct Provisioner {
    config: Arc<Config>,
    store: Arc<CertStore>,
    issuer: CertificateIssuer,
    bootstrapper: TrustBootstrapper,
    state: ProvisioningState,
}

impl Provisioner {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        config.validate().map_err(ProvisionError::Config)?;

        let store = Arc::new(CertStore::new(&config.storage));
        let keys = KeyStore::new(store.clone());
        let issuer = CertificateIssuer::new(config.clone(), store.clone(), keys)?;
        let bootstrapper = TrustBootstrapper::new(config.clone(), store.clone());
        let state = ProvisioningState::new(store.clone());

        Ok(Self {
            config,
            store,
            issuer,
            bootstrapper,
            state,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn authorize_url(&self) -> Result<String> {
        cert_issuer::authorize_url(&self.config)
            .map_err(|e| ProvisionError::Config(format!("Invalid authorization URL: {}", e)))
    }

    pub async fn issue_certificate(&self, redirect_input: &str) -> Result<IssueOutcome> {
        self.issuer.issue_certificate(redirect_input).await
    }

    pub async fn bootstrap_trust(&self, bridge_address: &str) -> Result<BridgeInfo> {
        self.bootstrapper.bootstrap_trust(bridge_address).await
    }

    pub fn current_step(&self) -> ProvisioningStep {
        self.state.current_step()
    }

    pub fn artifacts(&self) -> Vec<ArtifactStatus> {
        self.state.artifacts()
    }

    pub fn reset(&self) -> Result<()> {
        self.state.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Artifact;
    use crate::trust_bootstrap::tests::{spawn_bridge, PING_REPLY};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.login.client_id = String::new();
        let err = Provisioner::new(Arc::new(config)).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    /// Login, pair with the bridge, then reset, walking every wizard step.
    #[tokio::test]
    async fn full_wizard_flow() {
        let tmp = tempfile::tempdir().unwrap();

        // Vendor service: a real CA so the mock bridge can verify our client cert.
        let mut ca_params = rcgen::CertificateParams::default();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok", "token_type": "bearer"})),
            )
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.storage.dir = tmp.path().join("lutron");
        config.login.base_url = format!("{}/", server.uri());

        // The pairing endpoint must sign the CSR for our key, so create the key
        // up front and have the mock return a certificate for it.
        let store = Arc::new(CertStore::new(&config.storage));
        let key = KeyStore::new(store.clone()).get_or_create_key().unwrap();
        let app_key = rcgen::KeyPair::try_from(key.to_pkcs8_der().unwrap().as_slice()).unwrap();
        let mut app_params = rcgen::CertificateParams::default();
        app_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let app_cert = app_params.signed_by(&app_key, &ca_cert, &ca_key).unwrap();
        Mock::given(method("POST"))
            .and(path("/api/v1/remotepairing/application/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "remote_signs_app_certificate": app_cert.pem(),
                "local_signs_remote_certificate": ca_cert.pem(),
            })))
            .mount(&server)
            .await;

        let bridge = spawn_bridge(ca_cert.der().clone(), vec![PING_REPLY]).await;
        config.bridge.leap_port = bridge.port;

        let provisioner = Provisioner::new(Arc::new(config)).unwrap();
        assert_eq!(provisioner.current_step(), ProvisioningStep::Login);

        let outcome = provisioner
            .issue_certificate("https://device-login.lutron.com/lutron_app_oauth_redirect?code=deadbeef")
            .await
            .unwrap();
        assert_eq!(outcome, IssueOutcome::Issued);
        assert_eq!(provisioner.current_step(), ProvisioningStep::BridgePairing);

        let info = provisioner.bootstrap_trust("127.0.0.1").await.unwrap();
        assert_eq!(info.leap_version, "08.00");
        assert_eq!(provisioner.current_step(), ProvisioningStep::Complete);
        assert!(provisioner.artifacts().iter().all(|a| a.present));

        provisioner.reset().unwrap();
        assert_eq!(provisioner.current_step(), ProvisioningStep::Login);
        assert!(!store.exists(Artifact::PrivateKey));
    }
}
