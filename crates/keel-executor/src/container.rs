//! Container image build and push through a container CLI.

use async_trait::async_trait;
use keel_core::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::process::{Invocation, redacted_stderr_tail};

/// Everything needed to build and push one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuildRequest {
    pub resource_id: String,
    pub context: PathBuf,
    /// Relative to `context` unless absolute.
    pub dockerfile: Option<PathBuf>,
    pub platform: String,
    /// `<repository>:<tag>`.
    pub image_uri: String,
}

impl ImageBuildRequest {
    /// Registry host of the image, if the repository names one
    /// (`host.domain/...`, `host:port/...` or `localhost/...`).
    pub fn registry(&self) -> Option<&str> {
        let (first, _) = self.image_uri.split_once('/')?;
        (first.contains('.') || first.contains(':') || first == "localhost").then_some(first)
    }
}

/// Image uri for a repository and tag.
pub fn image_uri(repository: &str, tag: &str) -> String {
    format!("{repository}:{tag}")
}

/// Builds and pushes container images.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_and_push(&self, request: &ImageBuildRequest, cancel: &CancellationToken) -> Result<()>;
}

/// Registry login credentials. The password is only ever written to the
/// login command's stdin.
#[derive(Clone)]
pub struct RegistryLogin {
    pub username: String,
    password: String,
}

impl RegistryLogin {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("username", &self.username)
            .field("password", &keel_core::value::REDACTED)
            .finish()
    }
}

/// [`ImageBuilder`] driving `docker` (or a compatible CLI such as `podman`).
///
/// Steps, in order: `login` (only with credentials), `build`, `push`. Any
/// non-zero exit aborts with `ActionFailed` naming the step.
#[derive(Debug, Clone)]
pub struct ContainerTool {
    program: String,
    login: Option<RegistryLogin>,
}

impl ContainerTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            login: None,
        }
    }

    pub fn with_login(mut self, login: Option<RegistryLogin>) -> Self {
        self.login = login;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments of the `build` step.
    pub fn build_args(request: &ImageBuildRequest) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--platform".to_string(),
            request.platform.clone(),
            "-t".to_string(),
            request.image_uri.clone(),
        ];
        if let Some(dockerfile) = &request.dockerfile {
            let path = if dockerfile.is_absolute() {
                dockerfile.clone()
            } else {
                request.context.join(dockerfile)
            };
            args.push("-f".to_string());
            args.push(path.display().to_string());
        }
        args.push(request.context.display().to_string());
        args
    }

    async fn step(
        &self,
        name: &str,
        request: &ImageBuildRequest,
        invocation: Invocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(resource_id = %request.resource_id, step = name, "Running container step");
        let output = invocation.output(cancel).await?;
        if !output.status.success() {
            let secrets: Vec<String> = self.login.iter().map(|l| l.password.clone()).collect();
            let tail = redacted_stderr_tail(&output, &secrets);
            error!(
                resource_id = %request.resource_id,
                step = name,
                code = ?output.status.code(),
                "Container step failed"
            );
            return Err(Error::action_failed(
                &request.resource_id,
                format!("{name} failed ({}): {tail}", output.status),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for ContainerTool {
    async fn build_and_push(&self, request: &ImageBuildRequest, cancel: &CancellationToken) -> Result<()> {
        if let Some(login) = &self.login {
            let mut invocation = Invocation::new(&self.program)
                .args(["login", "--username", login.username.as_str(), "--password-stdin"])
                .stdin(login.password.clone().into_bytes());
            if let Some(registry) = request.registry() {
                invocation = invocation.arg(registry);
            }
            self.step("login", request, invocation, cancel).await?;
        }

        let build = Invocation::new(&self.program).args(Self::build_args(request));
        self.step("build", request, build, cancel).await?;

        let push = Invocation::new(&self.program).args(["push", request.image_uri.as_str()]);
        self.step("push", request, push, cancel).await?;

        info!(resource_id = %request.resource_id, image = %request.image_uri, "Image pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ImageBuildRequest {
        ImageBuildRequest {
            resource_id: "agent-image".into(),
            context: PathBuf::from("/src/agent"),
            dockerfile: Some(PathBuf::from("Dockerfile.prod")),
            platform: "linux/arm64".into(),
            image_uri: image_uri("123.dkr.ecr.us-east-1.amazonaws.com/cx-agent", "abc123def456"),
        }
    }

    #[test]
    fn test_build_args() {
        let args = ContainerTool::build_args(&request());
        assert_eq!(
            args,
            vec![
                "build",
                "--platform",
                "linux/arm64",
                "-t",
                "123.dkr.ecr.us-east-1.amazonaws.com/cx-agent:abc123def456",
                "-f",
                "/src/agent/Dockerfile.prod",
                "/src/agent",
            ]
        );
    }

    #[test]
    fn test_registry_host_detection() {
        assert_eq!(request().registry(), Some("123.dkr.ecr.us-east-1.amazonaws.com"));

        let mut hub = request();
        hub.image_uri = image_uri("library/python", "3");
        assert_eq!(hub.registry(), None);

        let mut local = request();
        local.image_uri = image_uri("localhost:5000/app", "1");
        assert_eq!(local.registry(), Some("localhost:5000"));
    }

    #[test]
    fn test_login_debug_hides_password() {
        let login = RegistryLogin::new("AWS", "p4ssw0rd");
        assert!(!format!("{login:?}").contains("p4ssw0rd"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_step_reports_name_and_stderr() {
        // `false` ignores its arguments and exits 1.
        let tool = ContainerTool::new("false");
        let err = tool
            .build_and_push(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::ActionFailed { resource_id, cause } => {
                assert_eq!(resource_id, "agent-image");
                assert!(cause.starts_with("build failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_login_failure_masks_password() {
        use std::os::unix::fs::PermissionsExt;

        // A tool that echoes the password it was given on stdin.
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-docker");
        std::fs::write(&script, "#!/bin/sh\necho \"bad credentials: $(cat)\" >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tool = ContainerTool::new(script.display().to_string())
            .with_login(Some(RegistryLogin::new("AWS", "p4ssw0rd-from-ecr")));
        let err = tool
            .build_and_push(&request(), &CancellationToken::new())
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.starts_with("action failed for 'agent-image': login failed"));
        assert!(message.contains("bad credentials"));
        assert!(!message.contains("p4ssw0rd-from-ecr"));
    }
}
