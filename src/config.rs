//! Command line and environment configuration
//!
//! Every flag can also be set from the environment, which is how the
//! controller is configured when deployed.

use std::fmt;
use std::time::Duration;

use clap::Parser;

use crate::context::ControllerSettings;
use crate::session::Credentials;

/// CAPV - Cluster API infrastructure controller for vSphere machines
#[derive(Parser, Clone)]
#[command(name = "capv", version, about, long_about = None)]
pub struct Config {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Name this controller instance reports in its logs
    #[arg(long, env = "CAPV_CONTROLLER_NAME", default_value = "capv-controller-manager")]
    pub controller_name: String,

    /// Namespace the controller itself runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "capv-system")]
    pub controller_namespace: String,

    /// Only watch resources in this namespace (all namespaces when unset)
    #[arg(long, env = "CAPV_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Username for the vSphere endpoint
    #[arg(long, env = "VSPHERE_USERNAME", default_value = "")]
    pub username: String,

    /// Password for the vSphere endpoint
    #[arg(long, env = "VSPHERE_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// Serve provider sessions from the in-memory simulator
    #[arg(long, env = "CAPV_SIMULATOR")]
    pub simulator: bool,

    /// Emit logs as JSON
    #[arg(long, env = "CAPV_LOG_JSON")]
    pub log_json: bool,

    /// Seconds between resyncs of a reconciled VSphereMachine
    #[arg(long, env = "CAPV_SYNC_PERIOD", default_value_t = 600)]
    pub sync_period_secs: u64,

    /// Seconds before retrying after a transient error
    #[arg(long, env = "CAPV_RETRY_REQUEUE", default_value_t = 5)]
    pub retry_requeue_secs: u64,

    /// Seconds before retrying after a configuration error
    #[arg(long, env = "CAPV_CONFIG_REQUEUE", default_value_t = 60)]
    pub config_requeue_secs: u64,

    /// Skip polling for a patched VSphereMachine to become visible
    #[arg(long, env = "CAPV_SKIP_PATCH_VERIFY")]
    pub skip_patch_verify: bool,

    /// Polls of the patched VSphereMachine before giving up
    #[arg(long, env = "CAPV_VERIFY_ATTEMPTS", default_value_t = 10)]
    pub verify_attempts: u32,

    /// Milliseconds between polls of the patched VSphereMachine
    #[arg(long, env = "CAPV_VERIFY_INTERVAL_MS", default_value_t = 1000)]
    pub verify_interval_ms: u64,
}

impl Config {
    /// Reconcile loop timing
    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            sync_period: Duration::from_secs(self.sync_period_secs),
            retry_requeue: Duration::from_secs(self.retry_requeue_secs),
            config_requeue: Duration::from_secs(self.config_requeue_secs),
            verify_patch: !self.skip_patch_verify,
            verify_attempts: self.verify_attempts.max(1),
            verify_interval: Duration::from_millis(self.verify_interval_ms),
        }
    }

    /// Provider credentials
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("crd", &self.crd)
            .field("controller_name", &self.controller_name)
            .field("controller_namespace", &self.controller_namespace)
            .field("watch_namespace", &self.watch_namespace)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("simulator", &self.simulator)
            .field("log_json", &self.log_json)
            .field("settings", &self.settings())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("capv").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_match_controller_settings() {
        let config = parse(&[]);
        assert!(!config.crd);
        assert!(config.watch_namespace.is_none());
        assert_eq!(config.settings(), ControllerSettings::default());
    }

    #[test]
    fn test_flags_override_timing() {
        let config = parse(&[
            "--sync-period-secs",
            "30",
            "--skip-patch-verify",
            "--verify-attempts",
            "0",
            "--verify-interval-ms",
            "250",
        ]);
        let settings = config.settings();
        assert_eq!(settings.sync_period, Duration::from_secs(30));
        assert!(!settings.verify_patch);
        assert_eq!(settings.verify_attempts, 1);
        assert_eq!(settings.verify_interval, Duration::from_millis(250));
    }

    /// Story: Logging the configuration never leaks the password
    #[test]
    fn story_debug_output_redacts_password() {
        let config = parse(&["--username", "admin", "--password", "hunter2"]);
        let rendered = format!("{config:?}");
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(config.credentials().username, "admin");
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Config::command().debug_assert();
    }
}
