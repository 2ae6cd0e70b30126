//! Node daemon: the enrollment API over a rotating identity.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;

use cohort_common::paths;
use cohort_enroll::EnrollmentServer;
use cohort_pki::cached::CachedSource;
use cohort_pki::expiry::AfterProgress;
use cohort_pki::keys::NodeKeyPair;
use cohort_pki::source::{CertSource, SelfSignedSource, SourceSet};
use cohort_pki::ca;

use crate::serve;

#[derive(Args)]
pub struct NodeArgs {
    /// Address the enrollment API listens on.
    #[arg(long, default_value = "0.0.0.0:23557")]
    pub listen: SocketAddr,

    /// State directory; defaults to the per-user cohort directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Logical name for the bootstrap certificate. Defaults to the
    /// hostname; the enrolled name is assigned by the hub.
    #[arg(long)]
    pub name: Option<String>,
}

pub async fn run(args: NodeArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let data_dir = args.data_dir.unwrap_or_else(paths::cohort_data_dir);
    let key = Arc::new(NodeKeyPair::load_or_generate(
        &data_dir.join("node.key.pem"),
    )?);
    let name = args.name.unwrap_or_else(default_name);

    let server = EnrollmentServer::open(paths::enrollment_dir(&data_dir), key.clone())?;

    // Enrollment identity first; cached self-signed bootstrap second.
    let sources = Arc::new(SourceSet::new());
    sources.append(server.clone() as Arc<dyn CertSource>);
    let bootstrap = SelfSignedSource::new(&name, ca::local_sans(), key);
    sources.append(Arc::new(CachedSource::with_mirror(
        Arc::new(bootstrap),
        Box::new(AfterProgress::half_life()),
        paths::certs_dir(&data_dir).join("bootstrap"),
    )));

    let mut manager_rx = server.manager_address();
    match manager_rx.borrow_and_update().as_deref() {
        Some(addr) => tracing::info!(name = %name, manager = %addr, "node enrolled"),
        None => tracing::info!(name = %name, "node unenrolled, serving bootstrap identity"),
    }
    let watch_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = watch_cancel.cancelled() => break,
                changed = manager_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            match manager_rx.borrow_and_update().as_deref() {
                Some(addr) => tracing::info!(manager = %addr, "enrollment changed"),
                None => tracing::info!("enrollment removed"),
            }
        }
    });

    let app = cohort_enroll::http::routes(server);
    serve::serve_tls(args.listen, sources, app, cancel).await
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "cohort-node".into())
}
