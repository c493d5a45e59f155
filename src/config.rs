use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Certificate material for the optional TLS upgrade, loaded from PEM files
/// at server construction
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

/// Immutable server-wide settings, shared read-only by every connection
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address; port 0 picks any free port
    pub addr: SocketAddr,
    pub tls: Option<TlsConfig>,
    /// Path prefix under which inline response crafting is anchored
    pub craft_anchor: String,
    /// Directory of static resources, used by the app and by `<"file"` specs
    pub staticdir: Option<PathBuf>,
    /// `(pattern, spec)` pairs bound to fixed crafted responses, matched in
    /// order before the crafting path
    pub anchors: Vec<(String, String)>,
    /// Upper bound on the rendered size of any crafted response
    pub sizelimit: Option<u64>,
    /// Disable the fallback web application
    pub noweb: bool,
    /// Disable inline response crafting
    pub nocraft: bool,
    /// Disable the administrative API and the transaction log
    pub noapi: bool,
    /// Reject crafted responses containing pause actions
    pub nohang: bool,
    /// Idle timeout applied to every blocking read
    pub timeout: Option<Duration>,
    /// Capture raw request bytes into the transaction log
    pub logreq: bool,
    /// Capture raw response bytes into the transaction log
    pub logresp: bool,
    /// Render captured bytes as a hex dump in diagnostic output
    pub hexdump: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            tls: None,
            craft_anchor: "/p/".to_string(),
            staticdir: None,
            anchors: Vec::new(),
            sizelimit: None,
            noweb: false,
            nocraft: false,
            noapi: false,
            nohang: false,
            timeout: None,
            logreq: false,
            logresp: false,
            hexdump: false,
        }
    }
}

impl Config {
    pub fn request_settings(&self) -> RequestSettings {
        RequestSettings {
            staticdir: self.staticdir.clone(),
        }
    }
}

/// Settings threaded into specification parsing
#[derive(Debug, Clone, Default)]
pub struct RequestSettings {
    pub staticdir: Option<PathBuf>,
}
