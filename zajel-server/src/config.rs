//! Server configuration from CLI flags and `ZAJEL_*` environment.

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "zajel-server", about = "Zajel signaling and rendezvous server")]
pub struct ServerConfig {
    /// Client WebSocket + admin HTTP port.
    #[arg(long, env = "ZAJEL_PORT", default_value_t = 8443)]
    pub port: u16,

    /// Listen port for server-to-server federation links.
    #[arg(long, env = "ZAJEL_FEDERATION_PORT", default_value_t = 7100)]
    pub federation_port: u16,

    /// Advertised federation endpoint (host:port). Defaults to
    /// 127.0.0.1:<federation_port> which is only useful for local testing.
    #[arg(long, env = "ZAJEL_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Endpoint of any existing federation member to join through.
    #[arg(long, env = "ZAJEL_BOOTSTRAP_URL")]
    pub bootstrap_url: Option<String>,

    /// Additional federation peer endpoints to dial at startup,
    /// comma-separated.
    #[arg(long, env = "ZAJEL_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Region label gossiped as member metadata.
    #[arg(long, env = "ZAJEL_REGION", default_value = "global")]
    pub region: String,

    /// HS256 secret for the admin JWT. Admin endpoints return 401 when unset.
    #[arg(long, env = "ZAJEL_ADMIN_JWT_SECRET")]
    pub admin_jwt_secret: Option<String>,

    /// Exact origin allowed to call admin endpoints cross-origin, with
    /// credentials. Unset means same-origin only.
    #[arg(long, env = "ZAJEL_ADMIN_UI_ORIGIN")]
    pub admin_ui_origin: Option<String>,

    /// SQLite database path. Unset uses an in-memory database (state does
    /// not survive restarts — only for development).
    #[arg(long, env = "ZAJEL_DB_PATH")]
    pub db_path: Option<String>,

    /// Keep the identity key in a local file next to the database instead
    /// of the OS secret store (for containers without a keyring daemon).
    #[arg(long, env = "ZAJEL_IDENTITY_FILE")]
    pub identity_file: Option<String>,

    /// PEM certificate chain for the client listener. TLS is enabled
    /// when both --tls-cert and --tls-key are set.
    #[arg(long, env = "ZAJEL_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// PEM private key for the client listener.
    #[arg(long, env = "ZAJEL_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Auto-accept pair requests and skip pinning. Development builds only.
    #[arg(long, default_value_t = false)]
    pub test_mode: bool,
}

impl ServerConfig {
    /// Reject configurations that must never reach production.
    pub fn validate(&self) -> Result<()> {
        if self.test_mode && !cfg!(debug_assertions) {
            anyhow::bail!("--test-mode is refused in release builds");
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            anyhow::bail!("--tls-cert and --tls-key must be set together");
        }
        Ok(())
    }

    /// Whether the client listener serves TLS.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Every federation endpoint to dial at startup.
    pub fn bootstrap_endpoints(&self) -> Vec<&str> {
        self.bootstrap_url
            .as_deref()
            .into_iter()
            .chain(self.peers.iter().map(String::as_str))
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// The federation endpoint we advertise to peers.
    pub fn advertised_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.federation_port))
    }
}
