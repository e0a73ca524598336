//! Configuration for [Dht](crate::Dht).

use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use crate::common::ValidatorRegistry;

use super::socket::DEFAULT_REQUEST_TIMEOUT;
use super::wire::Wire;

/// Maximum concurrent requests per search path.
pub const DEFAULT_ALPHA: usize = 3;
/// Number of disjoint search paths per lookup.
pub const DEFAULT_DISJOINT_PATHS: usize = 4;

/// How long provider records stay valid on the nodes storing them.
pub const DEFAULT_PROVIDER_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);
/// How often the reprovider checks for records due for re-announcement.
pub const DEFAULT_REPROVIDE_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Records are re-announced once within this duration of expiring.
pub const DEFAULT_REPROVIDE_THRESHOLD: Duration = Duration::from_secs(2 * 60 * 60);

/// Dht configurations.
pub struct Config {
    /// Bootstrap nodes as `host:port` strings.
    ///
    /// Defaults to an empty list; a node with no bootstrap nodes and an
    /// empty routing table can only be discovered by nodes contacting it.
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on. Defaults to an OS assigned port.
    pub port: Option<u16>,
    /// Duration before an inflight request to a non-responding node is
    /// abandoned. Defaults to [DEFAULT_REQUEST_TIMEOUT].
    pub request_timeout: Duration,
    /// Maximum concurrent requests per search path. Defaults to [DEFAULT_ALPHA].
    pub alpha: usize,
    /// Disjoint search paths per lookup. Defaults to [DEFAULT_DISJOINT_PATHS].
    pub disjoint_paths: usize,
    /// How long provider records stored on this node stay valid.
    pub provider_validity: Duration,
    pub reprovide_interval: Duration,
    pub reprovide_threshold: Duration,
    /// Per-namespace record validators. Defaults to the built-in
    /// `/immutable/` and `/signed/` namespaces.
    pub validators: ValidatorRegistry,
    /// Custom transport. Defaults to a UDP socket on `port`.
    pub wire: Option<Box<dyn Wire>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bootstrap: Vec::new(),
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            alpha: DEFAULT_ALPHA,
            disjoint_paths: DEFAULT_DISJOINT_PATHS,
            provider_validity: DEFAULT_PROVIDER_VALIDITY,
            reprovide_interval: DEFAULT_REPROVIDE_INTERVAL,
            reprovide_threshold: DEFAULT_REPROVIDE_THRESHOLD,
            validators: ValidatorRegistry::default(),
            wire: None,
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bootstrap", &self.bootstrap)
            .field("port", &self.port)
            .field("request_timeout", &self.request_timeout)
            .field("alpha", &self.alpha)
            .field("disjoint_paths", &self.disjoint_paths)
            .field("provider_validity", &self.provider_validity)
            .field("reprovide_interval", &self.reprovide_interval)
            .field("reprovide_threshold", &self.reprovide_threshold)
            .finish_non_exhaustive()
    }
}
