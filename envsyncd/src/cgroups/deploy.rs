use super::{DeploymentMode, DetectError};

/// Cgroup directories a container runtime creates for itself.
const RUNTIME_DIRS: &[&str] = &["docker", "lxc"];
/// Per-container scope or directory prefixes (`docker-<id>.scope`,
/// `cri-containerd-<id>.scope`, `lxc.payload.<name>`, ...).
const RUNTIME_PREFIXES: &[&str] = &[
    "docker-",
    "cri-containerd-",
    "crio-",
    "libpod-",
    "lxc.payload.",
];

/// Classify the deployment from the contents of `/proc/<pid>/cgroup`.
pub fn classify_deployment(contents: &str) -> Result<DeploymentMode, DetectError> {
    // hierarchy-ID:controller-list:cgroup-path
    let paths: Vec<&str> = contents
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .collect();

    if paths.is_empty() {
        return Err(DetectError::Parse {
            what: "cgroup membership",
            detail: contents.trim().to_string(),
        });
    }

    if paths.iter().any(|p| p.contains("kubepods")) {
        return Ok(DeploymentMode::Kubernetes);
    }

    if paths.iter().any(|p| p.split('/').any(is_runtime_segment)) {
        return Ok(DeploymentMode::Container);
    }

    let in_service = paths.iter().any(|p| {
        p.rsplit('/')
            .next()
            .is_some_and(|leaf| leaf.ends_with(".service"))
    });
    if in_service {
        return Ok(DeploymentMode::SystemdService);
    }

    Ok(DeploymentMode::Standalone)
}

/// Units such as `docker.service` or `lxcfs.service` run the runtime itself,
/// not a container.
fn is_runtime_segment(segment: &str) -> bool {
    if segment.ends_with(".service") {
        return false;
    }
    RUNTIME_DIRS.contains(&segment) || RUNTIME_PREFIXES.iter().any(|p| segment.starts_with(p))
}
