use shardcomm_common::CommunicatorConfig;
use std::time::Duration;

/// Dispatcher configuration.
///
/// Constructed at startup and handed to [`crate::ShardComm::new`]; there
/// is no process-global dispatcher.
#[derive(Debug, Clone)]
pub struct ShardCommConfig {
    /// Transport engine configuration.
    pub communicator: CommunicatorConfig,
    /// How often the background sweep checks tracked operations for
    /// elapsed answer deadlines.
    pub sweep_interval: Duration,
    /// Log resolution and connection failures at error level instead of
    /// info. Kept off while the cluster is still bootstrapping, when such
    /// failures are expected.
    pub log_connection_errors: bool,
}

impl Default for ShardCommConfig {
    fn default() -> Self {
        Self {
            communicator: CommunicatorConfig::default(),
            sweep_interval: Duration::from_secs(1),
            log_connection_errors: false,
        }
    }
}
