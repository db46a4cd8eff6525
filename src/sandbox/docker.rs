use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    CleanReport, CommandOutput, ContainerSpec, SandboxError, SandboxFuture, SandboxRuntime,
    SANDBOX_LABEL,
};

/// Drives the docker CLI.
///
/// Containers are created with:
/// - Network isolation (`--network=none`)
/// - Memory and memory+swap ceilings
/// - nproc, nofile and nice ulimits
/// - Optional CPU limit and AppArmor profile
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker_bin: String,
}

impl DockerRuntime {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn docker(&self, op: &'static str, args: &[String]) -> Result<String, SandboxError> {
        let output = self.command().args(args).output().await?;
        let output = collect_output(output);
        if !output.success() {
            return Err(SandboxError::Docker {
                op,
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Arguments for the one `docker run` call that creates a container. Every
/// limit goes here; nothing is applied to a container after it exists.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let limits = &spec.limits;
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--tty".to_string(),
        format!("--label={}=1", SANDBOX_LABEL),
    ];

    if limits.network_disabled {
        args.push("--network=none".to_string());
    }
    if let Some(ref memory) = limits.memory {
        args.push(format!("--memory={}", memory));
    }
    if let Some(ref swap) = limits.memory_swap {
        args.push(format!("--memory-swap={}", swap));
    }
    if let Some(ref cpus) = limits.cpus {
        args.push(format!("--cpus={}", cpus));
    }
    args.push(format!("--ulimit=nproc={0}:{0}", limits.max_procs));
    args.push(format!("--ulimit=nofile={0}:{0}", limits.max_files));
    args.push(format!("--ulimit=nice={0}:{0}", limits.nice));
    if let Some(ref profile) = limits.apparmor_profile {
        args.push(format!("--security-opt=apparmor={}", profile));
    }

    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host_path.display(), mount.container_path);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("--volume".to_string());
        args.push(volume);
    }

    args.push(spec.image.clone());
    args.push("/bin/bash".to_string());
    args
}

fn collect_output(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

/// `docker ps` arguments listing every container this crate started, running
/// or not. Containers without the sandbox label are left alone.
fn sandbox_list_args() -> Vec<String> {
    vec![
        "ps".to_string(),
        "--all".to_string(),
        "--quiet".to_string(),
        format!("--filter=label={}", SANDBOX_LABEL),
    ]
}

fn ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl DockerRuntime {
    /// Start `docker rm` for `id` on the current runtime. The task waits on
    /// the child, so it never lingers as a zombie. `None` outside a runtime.
    fn spawn_removal(&self, id: &str) -> Option<JoinHandle<std::io::Result<ExitStatus>>> {
        let handle = Handle::try_current().ok()?;
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["rm", "--force", "--volumes", id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let id = id.to_string();
        Some(handle.spawn(async move {
            let status = cmd.status().await;
            if let Err(ref e) = status {
                tracing::error!(container = %id, error = %e, "Failed to remove container");
            }
            status
        }))
    }
}

impl SandboxRuntime for DockerRuntime {
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> SandboxFuture<'a, String> {
        Box::pin(async move {
            let stdout = self.docker("run", &run_args(spec)).await?;
            let id = stdout.trim().to_string();
            if id.is_empty() {
                return Err(SandboxError::Docker {
                    op: "run",
                    message: "docker returned no container id".to_string(),
                });
            }
            Ok(id)
        })
    }

    fn exec<'a>(
        &'a self,
        id: &'a str,
        argv: &'a [String],
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> SandboxFuture<'a, CommandOutput> {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.arg("exec").arg(id).args(argv);
            tracing::debug!(container = %id, argv = ?argv, timeout_ms = timeout.as_millis() as u64, "Executing in container");

            // Dropping the output future kills the docker client; the process inside
            // the container dies when the caller removes the container.
            tokio::select! {
                result = cmd.output() => Ok(collect_output(result?)),
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(container = %id, timeout_ms = timeout.as_millis() as u64, "Container command timed out");
                    Err(SandboxError::Timeout(timeout))
                }
                _ = cancel.cancelled() => Err(SandboxError::Cancelled),
            }
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> SandboxFuture<'a, ()> {
        Box::pin(async move {
            let args = ["rm", "--force", "--volumes", id].map(String::from);
            self.docker("rm", &args).await?;
            Ok(())
        })
    }

    fn remove_detached(&self, id: &str) {
        if self.spawn_removal(id).is_some() {
            return;
        }
        // No runtime to wait on the child, so a thread reaps it instead.
        let spawned = std::process::Command::new(&self.docker_bin)
            .args(["rm", "--force", "--volumes", id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => {
                tracing::error!(container = %id, error = %e, "Failed to spawn container removal");
            }
        }
    }

    fn clean(&self) -> SandboxFuture<'_, CleanReport> {
        Box::pin(async move {
            let mut report = CleanReport::default();

            for id in ids(&self.docker("ps", &sandbox_list_args()).await?) {
                self.remove(&id).await?;
                report.containers += 1;
            }

            let images = ["images", "--quiet", "--filter=dangling=true"].map(String::from);
            for image in ids(&self.docker("images", &images).await?) {
                let args = ["rmi".to_string(), "--force".to_string(), image];
                self.docker("rmi", &args).await?;
                report.images += 1;
            }
            Ok(report)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::{Mount, ResourceLimits};
    use std::path::PathBuf;

    fn spec(config: &SandboxConfig) -> ContainerSpec {
        ContainerSpec {
            image: "grader:latest".to_string(),
            limits: ResourceLimits::from(config),
            mounts: vec![Mount {
                host_path: PathBuf::from("/tmp/work"),
                container_path: "/work".to_string(),
                read_only: false,
            }],
        }
    }

    #[test]
    fn every_limit_is_in_the_create_call() {
        let args = run_args(&spec(&SandboxConfig::default()));
        let image_pos = args.iter().position(|a| a == "grader:latest").unwrap();

        for expected in [
            "--network=none",
            "--memory=1024m",
            "--memory-swap=1024m",
            "--ulimit=nproc=256:256",
            "--ulimit=nofile=256:256",
            "--ulimit=nice=5:5",
        ] {
            let pos = args
                .iter()
                .position(|a| a == expected)
                .unwrap_or_else(|| panic!("missing {} in {:?}", expected, args));
            assert!(pos < image_pos, "{} must precede the image", expected);
        }
        assert_eq!(args[0], "run");
        assert_eq!(args.last().map(String::as_str), Some("/bin/bash"));
    }

    #[test]
    fn mounts_and_optional_limits() {
        let config = SandboxConfig {
            cpu_limit: Some("0.5".into()),
            apparmor_profile: Some("grader".into()),
            network_disabled: false,
            ..SandboxConfig::default()
        };
        let args = run_args(&spec(&config));
        assert!(args.contains(&"--cpus=0.5".to_string()));
        assert!(args.contains(&"--security-opt=apparmor=grader".to_string()));
        assert!(!args.contains(&"--network=none".to_string()));
        let volume = args.iter().position(|a| a == "--volume").unwrap();
        assert_eq!(args[volume + 1], "/tmp/work:/work");
    }

    #[test]
    fn containers_are_labelled() {
        let args = run_args(&spec(&SandboxConfig::default()));
        assert!(args.contains(&format!("--label={}=1", SANDBOX_LABEL)));
    }

    #[test]
    fn clean_only_lists_labelled_containers() {
        let args = sandbox_list_args();
        assert_eq!(args[0], "ps");
        assert!(args.contains(&"--all".to_string()));
        assert!(args.contains(&format!("--filter=label={}", SANDBOX_LABEL)));

        // The filter matches the label every started container carries
        let run = run_args(&spec(&SandboxConfig::default()));
        let label = run.iter().find_map(|a| a.strip_prefix("--label=")).unwrap();
        assert_eq!(label.split('=').next(), Some(SANDBOX_LABEL));
    }

    #[test]
    fn ids_skip_blank_lines() {
        assert_eq!(ids("abc\n\n def \n"), vec!["abc", "def"]);
    }

    #[tokio::test]
    async fn detached_removal_waits_for_the_child() {
        let runtime = DockerRuntime::new("true");
        let status = runtime
            .spawn_removal("abc")
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn detached_removal_outside_a_runtime() {
        let runtime = DockerRuntime::new("true");
        assert!(runtime.spawn_removal("abc").is_none());
        runtime.remove_detached("abc");
    }

    /// Children of this process currently in state Z.
    #[cfg(target_os = "linux")]
    fn zombie_children() -> usize {
        let me = std::process::id().to_string();
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| std::fs::read_to_string(e.path().join("stat")).ok())
            .filter(|stat| {
                // "pid (comm) state ppid ..."; comm may contain spaces
                let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
                    return false;
                };
                let mut fields = rest.split_whitespace();
                fields.next() == Some("Z") && fields.next() == Some(me.as_str())
            })
            .count()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detached_removal_leaves_no_zombies() {
        let runtime = DockerRuntime::new("true");
        let before = zombie_children();
        for i in 0..5 {
            runtime.remove_detached(&format!("container-{}", i));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(zombie_children() <= before);
    }
}
