//! Hub daemon: the hub API served under the hub's own CA.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;

use cohort_common::paths;
use cohort_hub::{Hub, Registry};
use cohort_pki::authority::AuthoritySource;
use cohort_pki::ca;
use cohort_pki::cached::CachedSource;
use cohort_pki::expiry::AfterProgress;
use cohort_pki::keys::NodeKeyPair;
use cohort_pki::source::{CertSource, DirectSource, TlsIdentity};

use crate::serve;

#[derive(Args)]
pub struct HubArgs {
    /// Address the hub API listens on.
    #[arg(long, default_value = "0.0.0.0:23558")]
    pub listen: SocketAddr,

    /// State directory; defaults to the per-user cohort directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Logical name of this hub.
    #[arg(long, default_value = "hub")]
    pub name: String,

    /// Address nodes use to reach this hub; recorded in every
    /// enrollment. Defaults to `<hostname>:<listen port>`.
    #[arg(long)]
    pub advertise: Option<String>,
}

pub async fn run(args: HubArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    let data_dir = args.data_dir.unwrap_or_else(paths::cohort_data_dir);
    let hub_dir = paths::hub_dir(&data_dir);
    let key = Arc::new(NodeKeyPair::load_or_generate(
        &hub_dir.join("hub.key.pem"),
    )?);

    let ca_identity = load_or_create_authority(&hub_dir, &args.name, &key)?;
    let authority: Arc<dyn CertSource> = Arc::new(DirectSource::new(ca_identity));

    let advertise = args
        .advertise
        .clone()
        .unwrap_or_else(|| format!("{}:{}", default_host(), args.listen.port()));
    tracing::info!(name = %args.name, advertise = %advertise, "hub starting");

    let registry = Arc::new(Registry::load_or_create(hub_dir.join("registry.json"))?);
    let hub = Arc::new(Hub::new(
        args.name.clone(),
        advertise,
        registry,
        authority.clone(),
    ));

    // The API listener's leaf is signed by the hub's own CA and rotates
    // at half-life.
    let leaf = AuthoritySource::new(authority, args.name.clone(), ca::local_sans(), key);
    let sources = Arc::new(CachedSource::with_mirror(
        Arc::new(leaf),
        Box::new(AfterProgress::half_life()),
        paths::certs_dir(&hub_dir),
    ));

    let app = cohort_hub::http::routes(hub);
    serve::serve_tls(args.listen, sources, app, cancel).await
}

/// The hub CA must be stable across restarts; enrolled nodes pin its
/// certificate as their trust root.
fn load_or_create_authority(
    dir: &Path,
    name: &str,
    key: &NodeKeyPair,
) -> anyhow::Result<TlsIdentity> {
    let cert_path = dir.join("ca.cert.pem");
    if cert_path.exists() {
        let cert_chain_pem = std::fs::read_to_string(&cert_path)?;
        return Ok(TlsIdentity {
            roots_pem: cert_chain_pem.clone(),
            cert_chain_pem,
            private_key_pem: key.private_key_pem().to_string(),
        });
    }

    let identity = ca::create_root_authority(name, key)?;
    std::fs::create_dir_all(dir)?;
    std::fs::write(&cert_path, &identity.cert_chain_pem)?;
    tracing::info!(path = %cert_path.display(), "created hub certificate authority");
    Ok(identity)
}

fn default_host() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".into())
}
