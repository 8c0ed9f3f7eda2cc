//! End-to-end runs through a real Docker daemon.
//!
//! Each test skips itself when no daemon is reachable or the sandbox image has
//! not been built. The exchange directory must be visible to the daemon, so the
//! tests stage into a temporary host directory and bind-mount that path.

use bollard::query_parameters::ListContainersOptions;
use coderunner_core::config::RunnerConfig;
use coderunner_core::orchestrator::{DockerSandbox, SandboxExecutor, CONTAINER_TIMEOUT};
use coderunner_core::types::{ExecutionConfig, ExecutionRequest, ForbiddenRule};
use std::collections::HashMap;
use tempfile::TempDir;

async fn sandbox(exchange: &TempDir) -> Option<DockerSandbox> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let open = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(exchange.path(), open).unwrap();
    }

    let mut config = RunnerConfig::default();
    config.docker.exchange_dir = exchange.path().to_path_buf();
    config.docker.exchange_mount = exchange.path().display().to_string();

    let sandbox = DockerSandbox::connect(&config).ok()?;
    if sandbox.docker().ping().await.is_err() {
        eprintln!("skipping: no Docker daemon");
        return None;
    }
    if sandbox.docker().inspect_image(&config.docker.image).await.is_err() {
        eprintln!("skipping: image {} not built", config.docker.image);
        return None;
    }
    Some(sandbox)
}

fn request(id: &str, code: &str, timeout: u64) -> ExecutionRequest {
    ExecutionRequest {
        submission_id: id.to_string(),
        code: code.to_string(),
        config: ExecutionConfig::default(),
        timeout,
    }
}

#[tokio::test]
async fn test_hello_world_in_container() {
    let exchange = TempDir::new().unwrap();
    let Some(sandbox) = sandbox(&exchange).await else { return };

    let result = sandbox.execute(request("docker-hello", r#"print("hi");"#, 5)).await;

    assert_eq!(result.submission_id, "docker-hello");
    assert!(result.success, "{:?}", result);
    assert_eq!(result.output, "hi\n");
    assert!(result.system_error.is_none());
    assert_eq!(std::fs::read_dir(exchange.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_blacklist_reaches_the_container() {
    let exchange = TempDir::new().unwrap();
    let Some(sandbox) = sandbox(&exchange).await else { return };

    let mut req = request("docker-blacklist", "import \"json\" as json;\njson::dumps(1);", 5);
    req.config.blacklist.push(ForbiddenRule {
        path: "json.dumps".to_string(),
        reason: "serialize by hand".to_string(),
    });
    let result = sandbox.execute(req).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("FORBIDDEN: serialize by hand"));
}

#[tokio::test]
async fn test_inner_deadline_wins_over_container_deadline() {
    let exchange = TempDir::new().unwrap();
    let Some(sandbox) = sandbox(&exchange).await else { return };

    let result = sandbox.execute(request("docker-loop", "loop {}", 1)).await;

    assert!(!result.success);
    assert_ne!(result.system_error.as_deref(), Some(CONTAINER_TIMEOUT));
    assert_eq!(
        result.error.as_deref(),
        Some("Time Limit Exceeded: execution exceeded 1 seconds.")
    );
}

#[tokio::test]
async fn test_repeated_submission_leaves_nothing_behind() {
    let exchange = TempDir::new().unwrap();
    let Some(sandbox) = sandbox(&exchange).await else { return };

    for round in 0..2 {
        let code = format!("print({});", round);
        let result = sandbox.execute(request("docker-repeat", &code, 5)).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.output, format!("{}\n", round));

        assert_eq!(std::fs::read_dir(exchange.path()).unwrap().count(), 0);
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec!["coderunner-docker-repeat".to_string()]);
        let leftovers = sandbox
            .docker()
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }
}
