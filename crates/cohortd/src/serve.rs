//! TLS serving over a rotating certificate source.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;

use cohort_pki::source::CertSource;

/// How often the listener asks its source for a rotated certificate.
const RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Serve `app` over TLS, reloading the listener's certificate whenever
/// the source yields a new leaf. Returns when cancelled.
pub async fn serve_tls(
    listen: SocketAddr,
    sources: Arc<dyn CertSource>,
    app: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let identity = sources.certs()?;
    let mut current_leaf = identity.leaf_der()?;
    let config = RustlsConfig::from_pem(
        identity.cert_chain_pem.clone().into_bytes(),
        identity.private_key_pem.clone().into_bytes(),
    )
    .await?;

    let reload = {
        let config = config.clone();
        let sources = sources.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RELOAD_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let identity = match sources.certs() {
                    Ok(identity) => identity,
                    Err(e) => {
                        tracing::debug!(error = %e, "certificate source unavailable");
                        continue;
                    }
                };
                let leaf = match identity.leaf_der() {
                    Ok(leaf) => leaf,
                    Err(e) => {
                        tracing::warn!(error = %e, "certificate source yielded unparseable chain");
                        continue;
                    }
                };
                if leaf == current_leaf {
                    continue;
                }
                match config
                    .reload_from_pem(
                        identity.cert_chain_pem.clone().into_bytes(),
                        identity.private_key_pem.clone().into_bytes(),
                    )
                    .await
                {
                    Ok(()) => {
                        current_leaf = leaf;
                        tracing::info!("listener certificate reloaded");
                    }
                    Err(e) => tracing::warn!(error = %e, "certificate reload failed"),
                }
            }
        })
    };

    tracing::info!(%listen, "serving");
    let server = axum_server::bind_rustls(listen, config).serve(app.into_make_service());
    tokio::select! {
        result = server => result?,
        _ = cancel.cancelled() => {}
    }
    reload.abort();
    Ok(())
}
