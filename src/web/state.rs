//! Shared state for the HTTP front door.

use std::path::PathBuf;
use std::sync::Arc;

use crate::directory::ChannelDirectory;
use crate::session::SessionManager;
use crate::tuner::TunerPool;

/// Fixed device identity advertised to Plex.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Name shown in Plex's tuner setup.
    pub friendly_name: String,
    /// Fake device id; only needs to be unique on the LAN.
    pub device_id: String,
    /// Externally reachable base URL of this gateway.
    pub base_url: String,
}

/// Everything the request handlers need. Constructed once at startup and
/// passed by `Arc`; handlers never touch ambient globals.
pub struct GatewayState {
    pub directory: Arc<ChannelDirectory>,
    pub tuner_pool: Arc<TunerPool>,
    pub sessions: Arc<SessionManager>,
    pub identity: DeviceIdentity,
    /// Cached XMLTV guide file, when guide refresh is enabled.
    pub guide_path: Option<PathBuf>,
}
