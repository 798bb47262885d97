use std::time::Duration;

/// Dispatcher configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Container CLI executable (default: `docker`).
    pub docker_bin: String,
    /// Period of the safety-net sweep. `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl DispatcherConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var               | Default  |
    /// |-----------------------|----------|
    /// | `DOCKER_BIN`          | `docker` |
    /// | `SWEEP_INTERVAL_SECS` | `60`     |
    ///
    /// `SWEEP_INTERVAL_SECS=0` turns the periodic sweep off; builds are then
    /// only picked up when one is enqueued.
    pub fn from_env() -> Self {
        let docker_bin = std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".into());

        let sweep_secs: u64 = std::env::var("SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .expect("SWEEP_INTERVAL_SECS must be a valid u64");

        Self {
            docker_bin,
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}
