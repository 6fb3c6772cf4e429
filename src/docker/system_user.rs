//! Running sandboxes as host system users.

use tracing::{debug, warn};

use super::spec::SandboxSpec;
use crate::config::SystemUserConfig;
use crate::error::{Result, SpawnError};
use crate::hub::PersistedState;
use crate::naming::{render_name, TemplateNamespace};

/// The parts of a passwd entry the sandbox needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub user_id: u32,
    pub group_id: u32,
    pub home_dir: String,
}

#[cfg(unix)]
pub fn lookup_passwd(username: &str) -> Result<Option<PasswdEntry>> {
    let user = nix::unistd::User::from_name(username)
        .map_err(|e| SpawnError::Config(format!("passwd lookup for {username} failed: {e}")))?;
    Ok(user.map(|user| PasswdEntry {
        user_id: user.uid.as_raw(),
        group_id: user.gid.as_raw(),
        home_dir: user.dir.to_string_lossy().into_owned(),
    }))
}

#[cfg(not(unix))]
pub fn lookup_passwd(_username: &str) -> Result<Option<PasswdEntry>> {
    Ok(None)
}

/// Ids and home directories for one sandbox user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemUser {
    pub name: String,
    pub user_id: u32,
    pub group_id: Option<u32>,
    pub host_home_dir: String,
    pub home_dir: String,
}

impl SystemUser {
    /// Persisted ids win; the passwd database is consulted only for what
    /// the state lacks.
    pub fn resolve<F>(
        config: &SystemUserConfig,
        ns: &TemplateNamespace,
        state: &PersistedState,
        lookup: F,
    ) -> Result<Self>
    where
        F: FnOnce(&str) -> Result<Option<PasswdEntry>>,
    {
        let name = ns.raw_username.clone();
        let host_format = config.host_homedir_format_string.as_str();
        let needs_passwd =
            state.user_id.is_none() || state.group_id.is_none() || host_format.is_empty();
        let passwd = if needs_passwd {
            lookup(&name).unwrap_or_else(|e| {
                warn!("Could not look up system user {}: {}", name, e);
                None
            })
        } else {
            None
        };

        let user_id = state
            .user_id
            .or(passwd.as_ref().map(|entry| entry.user_id))
            .ok_or_else(|| SpawnError::Config(format!("no user id known for {name}")))?;
        let group_id = state.group_id.or(passwd.as_ref().map(|entry| entry.group_id));

        // Home paths use the unescaped name.
        let raw_ns = TemplateNamespace {
            username: name.clone(),
            ..ns.clone()
        };
        let host_home_dir = if host_format.is_empty() {
            passwd
                .as_ref()
                .map(|entry| entry.home_dir.clone())
                .ok_or_else(|| SpawnError::Config(format!("no home directory known for {name}")))?
        } else {
            render_name(host_format, &raw_ns)
        };
        let home_dir = render_name(&config.image_homedir_format_string, &raw_ns);

        debug!(
            "System user {} is {}:{:?} with home {} (host {})",
            name, user_id, group_id, home_dir, host_home_dir
        );
        Ok(Self {
            name,
            user_id,
            group_id,
            host_home_dir,
            home_dir,
        })
    }

    pub fn process_user(&self) -> String {
        match self.group_id {
            Some(group_id) => format!("{}:{}", self.user_id, group_id),
            None => self.user_id.to_string(),
        }
    }

    /// Sets the process user, environment, working directory and home bind.
    pub fn apply(&self, spec: &mut SandboxSpec, config: &SystemUserConfig) {
        spec.user = Some(if config.run_as_root {
            "0".to_string()
        } else {
            self.process_user()
        });
        spec.working_dir = Some(self.home_dir.clone());
        spec.user_id = Some(self.user_id);
        spec.group_id = self.group_id;

        let env = &mut spec.environment;
        env.insert("USER".into(), self.name.clone());
        env.insert("NB_USER".into(), self.name.clone());
        env.insert("USER_ID".into(), self.user_id.to_string());
        env.insert("NB_UID".into(), self.user_id.to_string());
        env.insert("HOME".into(), self.home_dir.clone());
        if let Some(group_id) = self.group_id {
            env.insert("NB_GID".into(), group_id.to_string());
        }

        spec.binds = std::mem::take(&mut spec.binds).with_home_dir(
            &self.host_home_dir,
            &self.home_dir,
            config.homedir_bind_propagation.as_deref(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::SpawnerConfig;

    fn ns() -> TemplateNamespace {
        let naming = SpawnerConfig::default().naming();
        naming.namespace(&naming.identity("Bob.Smith", ""), "img")
    }

    fn config() -> SystemUserConfig {
        SystemUserConfig {
            enabled: true,
            ..SystemUserConfig::default()
        }
    }

    fn passwd(user_id: u32, group_id: u32) -> Result<Option<PasswdEntry>> {
        Ok(Some(PasswdEntry {
            user_id,
            group_id,
            home_dir: "/export/home/bob".into(),
        }))
    }

    #[test]
    fn persisted_ids_skip_the_passwd_database() {
        let state = PersistedState {
            user_id: Some(1000),
            group_id: Some(100),
            ..PersistedState::default()
        };
        let looked_up = Cell::new(false);
        let user = SystemUser::resolve(&config(), &ns(), &state, |_| {
            looked_up.set(true);
            passwd(1, 1)
        })
        .unwrap();
        assert!(!looked_up.get());
        assert_eq!(user.process_user(), "1000:100");
        assert_eq!(user.home_dir, "/home/Bob.Smith");
        assert_eq!(user.host_home_dir, "/home/Bob.Smith");
    }

    #[test]
    fn missing_ids_come_from_passwd() {
        let state = PersistedState {
            user_id: Some(1000),
            ..PersistedState::default()
        };
        let user = SystemUser::resolve(&config(), &ns(), &state, |name| {
            assert_eq!(name, "Bob.Smith");
            passwd(2000, 200)
        })
        .unwrap();
        assert_eq!(user.user_id, 1000);
        assert_eq!(user.group_id, Some(200));
    }

    #[test]
    fn empty_host_format_uses_passwd_home() {
        let config = SystemUserConfig {
            host_homedir_format_string: String::new(),
            ..config()
        };
        let user =
            SystemUser::resolve(&config, &ns(), &PersistedState::default(), |_| passwd(1, 2))
                .unwrap();
        assert_eq!(user.host_home_dir, "/export/home/bob");
    }

    #[test]
    fn unknown_user_is_a_config_error() {
        let err = SystemUser::resolve(&config(), &ns(), &PersistedState::default(), |_| Ok(None))
            .unwrap_err();
        assert!(matches!(err, SpawnError::Config(_)));

        let err = SystemUser::resolve(&config(), &ns(), &PersistedState::default(), |_| {
            Err(SpawnError::Config("nss unavailable".into()))
        })
        .unwrap_err();
        assert!(matches!(err, SpawnError::Config(_)));
    }

    #[tokio::test]
    async fn apply_sets_user_env_and_home_bind() {
        let mut spawner = SpawnerConfig::default();
        spawner.system_user = SystemUserConfig {
            homedir_bind_propagation: Some("rslave".into()),
            ..config()
        };
        let identity = spawner.naming().identity("Bob.Smith", "");
        let mut spec = SandboxSpec::resolve(&spawner, &identity, None).await.unwrap();
        let user = SystemUser {
            name: "Bob.Smith".into(),
            user_id: 1000,
            group_id: None,
            host_home_dir: "/home/Bob.Smith".into(),
            home_dir: "/home/Bob.Smith".into(),
        };
        user.apply(&mut spec, &spawner.system_user);

        assert_eq!(spec.user.as_deref(), Some("1000"));
        assert_eq!(spec.working_dir.as_deref(), Some("/home/Bob.Smith"));
        assert_eq!(spec.environment["NB_USER"], "Bob.Smith");
        assert_eq!(spec.environment["NB_UID"], "1000");
        assert_eq!(spec.environment["HOME"], "/home/Bob.Smith");
        assert!(!spec.environment.contains_key("NB_GID"));
        let bind = spec.binds.get("/home/Bob.Smith").unwrap();
        assert_eq!(bind.mode, "rw");
        assert_eq!(bind.propagation.as_deref(), Some("rslave"));

        spawner.system_user.run_as_root = true;
        user.apply(&mut spec, &spawner.system_user);
        assert_eq!(spec.user.as_deref(), Some("0"));
        assert_eq!(spec.user_id, Some(1000));
    }
}
