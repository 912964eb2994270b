//! Worker runtime selection: direct child process or a container runtime
//! invocation with enumerated resource arguments.

use aegis_domain::agent::AgentLimits;
use aegis_domain::config::{ContainerConfig, SupervisorConfig};
use tokio::process::Command;

/// Command for the local runtime: the worker binary run directly.
pub fn local_command(config: &SupervisorConfig) -> Command {
    Command::new(&config.worker_binary)
}

/// Command for the container runtime. Per-agent limits override the
/// container defaults; network stays disabled unless opted in.
pub fn container_command(config: &ContainerConfig, agent_id: &str, limits: &AgentLimits) -> Command {
    let mut command = Command::new(&config.binary);
    command.arg("run").arg("--rm").arg("-i");
    command.arg("--name").arg(format!("aegis-worker-{agent_id}"));

    let memory_mb = limits.max_memory_mb.unwrap_or(config.memory_mb);
    command.arg("--memory").arg(format!("{memory_mb}m"));

    let cpus = limits.cpu_cores.unwrap_or(config.cpus);
    command.arg("--cpus").arg(format!("{cpus}"));

    command.arg("--pids-limit").arg(config.pids_limit.to_string());
    command.arg("--cap-drop").arg("ALL");

    if config.read_only {
        command.arg("--read-only");
    }
    command
        .arg("--tmpfs")
        .arg(format!("/tmp:rw,noexec,size={}m", config.tmpfs_mb));

    if let Some(profile) = &config.security_profile {
        command.arg("--security-opt").arg(profile);
    }
    if let Some(storage) = &config.storage_opt {
        command.arg("--storage-opt").arg(storage);
    } else if let Some(disk_mb) = limits.disk_quota_mb {
        command.arg("--storage-opt").arg(format!("size={disk_mb}m"));
    }
    if let Some(weight) = config.blkio_weight {
        command.arg("--blkio-weight").arg(weight.to_string());
    }

    if !config.network_enabled {
        command.arg("--network").arg("none");
    }

    command.arg(&config.image);
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn container_args_enumerated() {
        let config = ContainerConfig::default();
        let command = container_command(&config, "calc", &AgentLimits::default());
        let args = args_of(&command);

        assert!(args.contains(&"--memory".to_string()));
        assert!(args.contains(&"512m".to_string()));
        assert!(args.contains(&"--pids-limit".to_string()));
        assert!(args.contains(&"--cap-drop".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        // Network disabled by default.
        let net_idx = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[net_idx + 1], "none");
        // Image last.
        assert_eq!(args.last().unwrap(), "aegis-worker:latest");
    }

    #[test]
    fn agent_limits_override_defaults() {
        let config = ContainerConfig::default();
        let limits = AgentLimits {
            max_memory_mb: Some(1024),
            cpu_cores: Some(2.0),
            disk_quota_mb: Some(256),
            ..Default::default()
        };
        let args = args_of(&container_command(&config, "calc", &limits));

        assert!(args.contains(&"1024m".to_string()));
        assert!(args.contains(&"2".to_string()));
        assert!(args.contains(&"size=256m".to_string()));
    }

    #[test]
    fn network_opt_in() {
        let config = ContainerConfig {
            network_enabled: true,
            ..Default::default()
        };
        let args = args_of(&container_command(&config, "calc", &AgentLimits::default()));
        assert!(!args.contains(&"--network".to_string()));
    }

    #[test]
    fn local_command_uses_configured_binary() {
        let config = SupervisorConfig::default();
        let command = local_command(&config);
        assert_eq!(
            command.as_std().get_program().to_string_lossy(),
            "aegis-worker"
        );
    }
}
