use anyhow::{Context, Result};
use tracing::info;

use crate::progress::ProvisioningStep;
use crate::provisioner::Provisioner;
use crate::state::AppState;

pub async fn serve(provisioner: Provisioner, web_port: u16) -> Result<()> {
    std::fs::create_dir_all(provisioner.storage_dir()).with_context(|| {
        format!(
            "Failed to create certificate directory {}",
            provisioner.storage_dir().display()
        )
    })?;

    match provisioner.current_step() {
        ProvisioningStep::Login => info!("No certificate found, wizard starts at login"),
        ProvisioningStep::BridgePairing => {
            info!("Certificate found, wizard starts at bridge pairing")
        }
        ProvisioningStep::Complete => info!(
            "Provisioning already complete, files are in {}",
            provisioner.storage_dir().display()
        ),
    }

    let state = AppState::new(provisioner);
    let app = crate::web::router(state);
    let addr = format!("0.0.0.0:{}", web_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
