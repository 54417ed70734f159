//! Package manager abstraction.
//!
//! Installs run with the container's network temporarily attached; every
//! other operation runs offline. Package names are validated before any
//! engine call.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::container::ExecOutput;
use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::SandboxManager;
use crate::security::{validate_package_manager, validate_package_name};

pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
pub const LIST_TIMEOUT: Duration = Duration::from_secs(30);
pub const UNINSTALL_TIMEOUT: Duration = Duration::from_secs(120);
pub const INFO_TIMEOUT: Duration = Duration::from_secs(30);

/// Package managers permitted inside environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManagerKind {
    Npm,
    Yarn,
    Pip,
    Pip3,
    AptGet,
    Apk,
}

impl PackageManagerKind {
    pub const ALL: [PackageManagerKind; 6] = [
        PackageManagerKind::Npm,
        PackageManagerKind::Yarn,
        PackageManagerKind::Pip,
        PackageManagerKind::Pip3,
        PackageManagerKind::AptGet,
        PackageManagerKind::Apk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManagerKind::Npm => "npm",
            PackageManagerKind::Yarn => "yarn",
            PackageManagerKind::Pip => "pip",
            PackageManagerKind::Pip3 => "pip3",
            PackageManagerKind::AptGet => "apt-get",
            PackageManagerKind::Apk => "apk",
        }
    }

    fn install_prefix(&self) -> &'static str {
        match self {
            PackageManagerKind::Npm => "npm install",
            PackageManagerKind::Yarn => "yarn add",
            PackageManagerKind::Pip => "pip install",
            PackageManagerKind::Pip3 => "pip3 install",
            PackageManagerKind::AptGet => "apt-get update && apt-get install -y",
            PackageManagerKind::Apk => "apk add",
        }
    }

    fn uninstall_prefix(&self) -> &'static str {
        match self {
            PackageManagerKind::Npm => "npm uninstall",
            PackageManagerKind::Yarn => "yarn remove",
            PackageManagerKind::Pip => "pip uninstall -y",
            PackageManagerKind::Pip3 => "pip3 uninstall -y",
            PackageManagerKind::AptGet => "apt-get remove -y",
            PackageManagerKind::Apk => "apk del",
        }
    }

    fn info_prefix(&self) -> &'static str {
        match self {
            PackageManagerKind::Npm => "npm info",
            PackageManagerKind::Yarn => "yarn info",
            PackageManagerKind::Pip => "pip show",
            PackageManagerKind::Pip3 => "pip3 show",
            PackageManagerKind::AptGet => "apt-cache show",
            PackageManagerKind::Apk => "apk info",
        }
    }

    pub fn list_command(&self) -> &'static str {
        match self {
            PackageManagerKind::Npm => "npm list --depth=0",
            PackageManagerKind::Yarn => "yarn list --depth=0",
            PackageManagerKind::Pip => "pip list",
            PackageManagerKind::Pip3 => "pip3 list",
            PackageManagerKind::AptGet => "apt list --installed",
            PackageManagerKind::Apk => "apk info",
        }
    }

    /// Packages must already be validated.
    pub fn install_command(&self, packages: &[String]) -> String {
        format!("{} {}", self.install_prefix(), packages.join(" "))
    }

    pub fn uninstall_command(&self, packages: &[String]) -> String {
        format!("{} {}", self.uninstall_prefix(), packages.join(" "))
    }

    pub fn info_command(&self, package: &str) -> String {
        format!("{} {}", self.info_prefix(), package)
    }
}

impl std::fmt::Display for PackageManagerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PackageManagerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackageManagerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown package manager: {}", s))
    }
}

/// Result of a package manager invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl From<ExecOutput> for PackageOutput {
    fn from(output: ExecOutput) -> Self {
        Self {
            success: output.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

fn validate_packages(packages: &[String]) -> SandboxResult<()> {
    if packages.is_empty() {
        return Err(SandboxError::Validation(
            "No packages specified".to_string(),
        ));
    }
    for package in packages {
        validate_package_name(package).map_err(|reason| {
            SandboxError::Validation(format!("Invalid package name \"{}\": {}", package, reason))
        })?;
    }
    Ok(())
}

fn parse_manager(manager: &str) -> SandboxResult<PackageManagerKind> {
    validate_package_manager(manager).map_err(SandboxError::Validation)
}

pub struct PackageManager {
    sandbox: Arc<SandboxManager>,
}

impl PackageManager {
    pub fn new(sandbox: Arc<SandboxManager>) -> Self {
        Self { sandbox }
    }

    /// Install packages with the network attached for the duration of the call.
    ///
    /// The network is detached afterwards whatever the install outcome; a
    /// failure to detach is logged and does not replace the install result.
    pub async fn install_packages(
        &self,
        container_id: &str,
        manager: &str,
        packages: &[String],
    ) -> SandboxResult<PackageOutput> {
        let kind = parse_manager(manager)?;
        validate_packages(packages)?;

        self.sandbox.enable_network(container_id).await?;

        let command = kind.install_command(packages);
        info!("Installing in {}: {}", container_id, command);
        let result = self
            .sandbox
            .execute(container_id, &command, Some(INSTALL_TIMEOUT))
            .await;

        if let Err(e) = self.sandbox.disable_network(container_id).await {
            warn!(
                "Failed to disable network for container {}: {}",
                container_id, e
            );
        }

        result.map(PackageOutput::from)
    }

    pub async fn list_packages(
        &self,
        container_id: &str,
        manager: &str,
    ) -> SandboxResult<PackageOutput> {
        let kind = parse_manager(manager)?;
        let output = self
            .sandbox
            .execute(container_id, kind.list_command(), Some(LIST_TIMEOUT))
            .await?;
        Ok(output.into())
    }

    /// Runs offline; removal needs no registry access.
    pub async fn uninstall_packages(
        &self,
        container_id: &str,
        manager: &str,
        packages: &[String],
    ) -> SandboxResult<PackageOutput> {
        let kind = parse_manager(manager)?;
        validate_packages(packages)?;

        let command = kind.uninstall_command(packages);
        info!("Uninstalling in {}: {}", container_id, command);
        let output = self
            .sandbox
            .execute(container_id, &command, Some(UNINSTALL_TIMEOUT))
            .await?;
        Ok(output.into())
    }

    pub async fn get_package_info(
        &self,
        container_id: &str,
        manager: &str,
        package: &str,
    ) -> SandboxResult<PackageOutput> {
        let kind = parse_manager(manager)?;
        validate_packages(std::slice::from_ref(&package.to_string()))?;

        let output = self
            .sandbox
            .execute(container_id, &kind.info_command(package), Some(INFO_TIMEOUT))
            .await?;
        Ok(output.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CreateSandbox, SandboxConfig};
    use crate::environment::EnvironmentType;
    use crate::testing::FakeRuntime;

    async fn setup() -> (Arc<FakeRuntime>, PackageManager, String) {
        let fake = Arc::new(FakeRuntime::new());
        let config = SandboxConfig {
            start_settle_ms: 0,
            ..Default::default()
        };
        let sandbox = Arc::new(SandboxManager::new(fake.clone(), config));
        let id = sandbox
            .create(&CreateSandbox {
                user_id: "u1".to_string(),
                env_id: 1,
                env_type: EnvironmentType::Python,
                name: "pkgs".to_string(),
                cpu_cores: None,
                memory_mb: None,
            })
            .await
            .unwrap()
            .container_id;
        fake.clear_history();
        (fake, PackageManager::new(sandbox), id)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_templates() {
        let pkgs = names(&["requests", "flask"]);
        assert_eq!(
            PackageManagerKind::Pip.install_command(&pkgs),
            "pip install requests flask"
        );
        assert_eq!(
            PackageManagerKind::AptGet.install_command(&names(&["curl"])),
            "apt-get update && apt-get install -y curl"
        );
        assert_eq!(
            PackageManagerKind::Pip3.uninstall_command(&names(&["x"])),
            "pip3 uninstall -y x"
        );
        assert_eq!(PackageManagerKind::Apk.info_command("git"), "apk info git");
        assert_eq!(PackageManagerKind::Yarn.list_command(), "yarn list --depth=0");
    }

    #[test]
    fn test_kind_parse_and_serde() {
        assert_eq!("apt-get".parse::<PackageManagerKind>(), Ok(PackageManagerKind::AptGet));
        assert!("cargo".parse::<PackageManagerKind>().is_err());
        assert_eq!(
            serde_json::to_string(&PackageManagerKind::AptGet).unwrap(),
            "\"apt-get\""
        );
    }

    #[tokio::test]
    async fn test_install_toggles_network_around_exec() {
        let (fake, packages, id) = setup().await;
        fake.respond("pip install", 0, "Successfully installed requests\n", "");

        let output = packages
            .install_packages(&id, "pip", &names(&["requests"]))
            .await
            .unwrap();
        assert!(output.success);
        assert!(output.stdout.contains("Successfully installed"));

        let execs = fake.exec_history();
        let install = execs
            .iter()
            .find(|e| e.command.contains("pip install requests"))
            .unwrap();
        assert!(install.networked);
        assert!(fake.networks(&id).is_empty());
    }

    #[tokio::test]
    async fn test_network_disabled_after_failed_install() {
        let (fake, packages, id) = setup().await;
        fake.respond("pip install", 1, "", "No matching distribution found");

        let output = packages
            .install_packages(&id, "pip", &names(&["does-not-exist"]))
            .await
            .unwrap();
        assert!(!output.success);
        assert!(output.stderr.contains("No matching distribution"));
        assert!(fake.networks(&id).is_empty());
    }

    #[tokio::test]
    async fn test_network_disabled_after_install_timeout() {
        let (fake, packages, id) = setup().await;
        fake.hang_on("npm install");

        let err = packages
            .install_packages(&id, "npm", &names(&["left-pad"]))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(fake.networks(&id).is_empty());
    }

    #[tokio::test]
    async fn test_injection_rejected_before_network() {
        let (fake, packages, id) = setup().await;

        let err = packages
            .install_packages(&id, "pip", &names(&["requests; rm -rf /"]))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid package name \"requests; rm -rf /\""));
        assert!(fake.network_calls().is_empty());
        assert!(fake.exec_history().is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_manager_and_empty_list() {
        let (fake, packages, id) = setup().await;

        let err = packages
            .install_packages(&id, "cargo", &names(&["serde"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Allowed: npm, yarn, pip, pip3, apt-get, apk"));

        assert!(packages.install_packages(&id, "npm", &[]).await.is_err());
        assert!(fake.network_calls().is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_stays_offline() {
        let (fake, packages, id) = setup().await;
        packages
            .uninstall_packages(&id, "npm", &names(&["@babel/core"]))
            .await
            .unwrap();
        assert!(fake.network_calls().is_empty());
        assert!(
            fake.exec_history()
                .iter()
                .any(|e| e.command == "npm uninstall @babel/core")
        );
    }

    #[tokio::test]
    async fn test_list_and_info() {
        let (fake, packages, id) = setup().await;
        fake.respond("pip list", 0, "Package Version\nrequests 2.31\n", "");

        let listed = packages.list_packages(&id, "pip").await.unwrap();
        assert!(listed.stdout.contains("requests"));

        packages.get_package_info(&id, "pip", "requests").await.unwrap();
        assert!(fake.exec_history().iter().any(|e| e.command == "pip show requests"));

        assert!(packages.get_package_info(&id, "pip", "a|b").await.is_err());
    }
}
