//! Execution environments.
//!
//! Resolution is pure configuration selection: a rule's environment name
//! either refers to an environment that already exists, or to a
//! specification file that gets materialized the first time a task needs it.

use std::collections::HashMap;
use std::fs;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::EnvConfig;
use crate::core::Hash32;
use crate::utils::stderr_tail;

/// Suffix of environment specification files.
pub const SPEC_SUFFIX: &str = "yaml";

/// Where materialized environments live, relative to the working directory.
pub const ENV_PREFIX_DIR: &str = ".scflow/conda";

/// Written into a prefix once its environment was created successfully.
const READY_MARKER: &str = ".scflow-ready";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExecEnv {
    /// Pre-existing environment addressed by name.
    Named(String),
    /// Specification file, materialized on first use.
    Spec(Utf8PathBuf),
}

impl ExecEnv {
    pub fn resolve(config: &EnvConfig, name: &str) -> Self {
        if config.use_existing_envs {
            ExecEnv::Named(name.to_string())
        } else {
            ExecEnv::Spec(config.envs_path.join(format!("{name}.{SPEC_SUFFIX}")))
        }
    }
}

impl std::fmt::Display for ExecEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecEnv::Named(name) => write!(f, "env:{name}"),
            ExecEnv::Spec(path) => write!(f, "spec:{path}"),
        }
    }
}

/// How a task enters its environment once it's ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Name(String),
    Prefix(Utf8PathBuf),
}

impl Activation {
    /// Arguments for `<frontend> run`.
    pub fn run_args(&self) -> [&str; 2] {
        match self {
            Activation::Name(name) => ["-n", name.as_str()],
            Activation::Prefix(prefix) => ["-p", prefix.as_str()],
        }
    }
}

/// Set of environments referenced by the graph. The set itself is fixed
/// once the graph is built; each spec environment is materialized at most
/// once, even when several tasks request it concurrently.
pub struct EnvPool {
    root: Utf8PathBuf,
    frontend: String,
    slots: HashMap<ExecEnv, OnceLock<Result<Activation, String>>>,
}

impl EnvPool {
    pub fn new<'a>(
        config: &EnvConfig,
        root: impl Into<Utf8PathBuf>,
        envs: impl IntoIterator<Item = &'a ExecEnv>,
    ) -> Self {
        Self {
            root: root.into(),
            frontend: config.frontend.clone(),
            slots: envs
                .into_iter()
                .map(|env| (env.clone(), OnceLock::new()))
                .collect(),
        }
    }

    pub fn frontend(&self) -> &str {
        &self.frontend
    }

    /// Returns the activation of `env`, creating the environment first if it
    /// comes from a specification that hasn't been materialized yet.
    pub fn activate(&self, env: &ExecEnv) -> anyhow::Result<Activation> {
        let Some(slot) = self.slots.get(env) else {
            bail!("environment {env} is not part of this workflow");
        };

        slot.get_or_init(|| self.materialize(env).map_err(|e| format!("{e:#}")))
            .clone()
            .map_err(anyhow::Error::msg)
    }

    fn materialize(&self, env: &ExecEnv) -> anyhow::Result<Activation> {
        let spec = match env {
            ExecEnv::Named(name) => return Ok(Activation::Name(name.clone())),
            ExecEnv::Spec(spec) => self.root.join(spec),
        };

        let prefix = self.prefix_for(&spec)?;
        if prefix.join(READY_MARKER).is_file() {
            tracing::debug!(%spec, %prefix, "environment already materialized");
            return Ok(Activation::Prefix(prefix));
        }

        if prefix.exists() {
            tracing::warn!(%prefix, "removing incomplete environment");
            fs::remove_dir_all(&prefix)
                .with_context(|| format!("couldn't remove incomplete environment {prefix}"))?;
        }

        tracing::info!(%spec, %prefix, "creating environment");
        let output = Command::new(&self.frontend)
            .args(["env", "create", "--yes", "--quiet"])
            .arg("--prefix")
            .arg(prefix.as_str())
            .arg("--file")
            .arg(spec.as_str())
            .output()
            .with_context(|| format!("couldn't launch '{}'", self.frontend))?;

        if !output.status.success() {
            bail!(
                "creating environment from {spec} failed with {}\n{}",
                output.status,
                stderr_tail(&output.stderr, 20)
            );
        }

        fs::write(prefix.join(READY_MARKER), spec.as_str())
            .with_context(|| format!("couldn't mark environment {prefix} as ready"))?;

        Ok(Activation::Prefix(prefix))
    }

    /// Prefix directory keyed by the content of the specification, so an
    /// edited spec gets a fresh environment.
    fn prefix_for(&self, spec: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
        let hash = Hash32::hash_file(spec)
            .with_context(|| format!("couldn't read environment spec {spec}"))?;
        let short = &hash.to_hex()[..16];
        Ok(self.root.join(ENV_PREFIX_DIR).join(short))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(existing: bool) -> EnvConfig {
        EnvConfig {
            use_existing_envs: existing,
            envs_path: "workflow/envs".into(),
            frontend: "conda".into(),
        }
    }

    #[test]
    fn test_resolve_existing() {
        assert_eq!(
            ExecEnv::resolve(&config(true), "scanpy"),
            ExecEnv::Named("scanpy".into())
        );
    }

    #[test]
    fn test_resolve_spec() {
        assert_eq!(
            ExecEnv::resolve(&config(false), "scanpy"),
            ExecEnv::Spec("workflow/envs/scanpy.yaml".into())
        );
    }

    #[test]
    fn test_named_needs_no_materialization() {
        let env = ExecEnv::Named("scanpy".into());
        let pool = EnvPool::new(&config(true), "/nonexistent", [&env]);
        assert_eq!(
            pool.activate(&env).unwrap(),
            Activation::Name("scanpy".into())
        );
    }

    #[test]
    fn test_unknown_env_rejected() {
        let pool = EnvPool::new(&config(true), "/nonexistent", []);
        assert!(pool.activate(&ExecEnv::Named("x".into())).is_err());
    }

    #[test]
    fn test_missing_spec_fails_on_use() {
        let env = ExecEnv::Spec("missing.yaml".into());
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let pool = EnvPool::new(&config(false), root, [&env]);

        let err = pool.activate(&env).unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }

    #[test]
    fn test_ready_prefix_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::write(root.join("env.yaml"), "dependencies: [python]\n").unwrap();

        let env = ExecEnv::Spec("env.yaml".into());
        let pool = EnvPool::new(&config(false), root.clone(), [&env]);
        let prefix = pool.prefix_for(&root.join("env.yaml")).unwrap();
        fs::create_dir_all(&prefix).unwrap();
        fs::write(prefix.join(READY_MARKER), "").unwrap();

        assert_eq!(pool.activate(&env).unwrap(), Activation::Prefix(prefix));
    }

    /// Stand-in for the conda frontend. `$6` is the prefix.
    #[cfg(unix)]
    fn fake_frontend(root: &Utf8Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = root.join(name);
        fs::write(&path, format!("#!/bin/sh\nmkdir -p \"$6/conda-meta\"\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.into_string()
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_create_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::write(root.join("env.yaml"), "dependencies: [python]\n").unwrap();
        let env = ExecEnv::Spec("env.yaml".into());

        let broken = EnvConfig {
            frontend: fake_frontend(&root, "broken.sh", "echo 'pip install failed' >&2\nexit 1"),
            ..config(false)
        };
        let err = EnvPool::new(&broken, root.clone(), [&env])
            .activate(&env)
            .unwrap_err();
        assert!(err.to_string().contains("pip install failed"));

        let pool = EnvPool::new(&broken, root.clone(), [&env]);
        let prefix = pool.prefix_for(&root.join("env.yaml")).unwrap();
        assert!(prefix.join("conda-meta").is_dir());
        assert!(!prefix.join(READY_MARKER).exists());
        fs::write(prefix.join("leftover"), "").unwrap();

        let working = EnvConfig {
            frontend: fake_frontend(&root, "working.sh", "exit 0"),
            ..config(false)
        };
        let pool = EnvPool::new(&working, root.clone(), [&env]);
        assert_eq!(pool.activate(&env).unwrap(), Activation::Prefix(prefix.clone()));
        assert!(prefix.join(READY_MARKER).is_file());
        assert!(!prefix.join("leftover").exists());
    }
}
