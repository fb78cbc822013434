//! Computing resource configuration: merging the resource-level and
//! per-user payloads, and validating them for a backend kind.

use serde_json::Value;
use uuid::Uuid;

use tether_db::models::{Computing, ComputingKind};

use crate::error::{Result, TetherError};

/// The two conf payloads of a computing resource as seen by one user.
///
/// Lookups consult the resource-level payload first, so a value set by the
/// administrator cannot be overridden from a user payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceConf {
    sys: Option<Value>,
    user: Option<Value>,
}

impl ResourceConf {
    pub fn new(sys: Option<Value>, user: Option<Value>) -> Self {
        Self { sys, user }
    }

    /// Build the conf for `user` on `computing`. A user payload cannot be
    /// attached to a resource privately owned by somebody else.
    pub fn attach(
        computing: &Computing,
        user: Uuid,
        sys: Option<Value>,
        user_data: Option<Value>,
    ) -> Result<Self> {
        if user_data.is_some() && computing.owner_id.is_some_and(|owner| owner != user) {
            return Err(TetherError::Configuration(format!(
                "cannot attach user conf to computing resource {} owned by another user",
                computing.id
            )));
        }
        Ok(Self::new(sys, user_data))
    }

    /// Look a parameter up, resource-level payload first.
    pub fn param(&self, name: &str) -> Option<String> {
        lookup(self.sys.as_ref(), name).or_else(|| lookup(self.user.as_ref(), name))
    }

    /// Look a parameter up in the resource-level payload only.
    pub fn param_sys_only(&self, name: &str) -> Option<String> {
        lookup(self.sys.as_ref(), name)
    }

    /// [`ResourceConf::param`], or a configuration error naming `name`.
    pub fn require(&self, name: &str) -> Result<String> {
        self.param(name)
            .ok_or_else(|| TetherError::Configuration(format!("missing {name} in conf")))
    }

    pub fn sys(&self) -> Option<&Value> {
        self.sys.as_ref()
    }

    pub fn user(&self) -> Option<&Value> {
        self.user.as_ref()
    }
}

/// String and number values count; empty strings do not.
fn lookup(payload: Option<&Value>, name: &str) -> Option<String> {
    match payload?.get(name)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parameter names a backend kind needs, by category.
struct Requirements {
    /// Every group must be satisfied; a group is satisfied by any one key.
    hosts: &'static [&'static [&'static str]],
    users: &'static [&'static str],
}

fn requirements(kind: ComputingKind) -> Option<Requirements> {
    match kind {
        ComputingKind::Local => None,
        ComputingKind::Remote => Some(Requirements {
            hosts: &[&["host"]],
            users: &["user"],
        }),
        ComputingKind::Slurm => Some(Requirements {
            hosts: &[&["master", "host"]],
            users: &["user"],
        }),
        ComputingKind::RemoteHop => Some(Requirements {
            hosts: &[&["first_host"], &["second_host"]],
            users: &["first_user", "second_user"],
        }),
    }
}

/// Check that the merged payloads give `kind` a host, a user and a
/// credential (`password` or `identity`).
pub fn validate_conf_data(
    kind: ComputingKind,
    sys: Option<&Value>,
    user: Option<&Value>,
) -> Result<()> {
    let Some(req) = requirements(kind) else {
        return Ok(());
    };
    let conf = ResourceConf::new(sys.cloned(), user.cloned());

    for group in req.hosts {
        if !group.iter().any(|key| conf.param(key).is_some()) {
            return Err(TetherError::Configuration("missing host in conf".to_owned()));
        }
    }
    for key in req.users {
        if conf.param(key).is_none() {
            return Err(TetherError::Configuration("missing user in conf".to_owned()));
        }
    }
    if conf.param("password").is_none() && conf.param("identity").is_none() {
        return Err(TetherError::Configuration(
            "missing password or identity in conf".to_owned(),
        ));
    }
    Ok(())
}

/// Singularity bind list for a task: resource `binds` (from the
/// resource-level payload only when the task owner does not own the
/// resource) followed by the task's own extra binds.
pub fn binds_for(
    conf: &ResourceConf,
    computing: &Computing,
    task_owner: Uuid,
    extra_binds: Option<&str>,
) -> Vec<String> {
    let configured = if computing.is_owned_by(task_owner) {
        conf.param("binds")
    } else {
        conf.param_sys_only("binds")
    };

    configured
        .into_iter()
        .chain(extra_binds.map(str::to_owned))
        .flat_map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn computing(kind: ComputingKind, owner: Option<Uuid>) -> Computing {
        Computing {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "cluster".into(),
            kind,
            requires_sys_conf: true,
            requires_user_conf: true,
            requires_user_keys: true,
            supports_docker: false,
            supports_singularity: true,
            created_at: Utc::now(),
        }
    }

    fn assert_config_error(result: Result<()>, expected: &str) {
        match result {
            Err(TetherError::Configuration(msg)) => assert_eq!(msg, expected),
            other => panic!("expected configuration error {expected:?}, got {other:?}"),
        }
    }

    #[test]
    fn local_needs_nothing() {
        validate_conf_data(ComputingKind::Local, None, None).unwrap();
    }

    #[test]
    fn every_configured_kind_rejects_missing_categories() {
        let complete = |kind: ComputingKind| match kind {
            ComputingKind::RemoteHop => json!({
                "first_host": "gw.example.org", "first_user": "gw",
                "second_host": "node1", "second_user": "alice",
                "identity": "/keys/id_rsa"
            }),
            ComputingKind::Slurm => json!({"master": "slurm.example.org", "user": "alice", "password": "pw"}),
            _ => json!({"host": "h.example.org", "user": "alice", "identity": "/keys/id_rsa"}),
        };

        for kind in [ComputingKind::Remote, ComputingKind::Slurm, ComputingKind::RemoteHop] {
            let full = complete(kind);
            validate_conf_data(kind, Some(&full), None).unwrap();

            let strip = |keys: &[&str]| {
                let mut v = full.clone();
                for k in keys {
                    v.as_object_mut().unwrap().remove(*k);
                }
                v
            };

            let no_host = strip(&["host", "master", "first_host", "second_host"]);
            assert_config_error(
                validate_conf_data(kind, Some(&no_host), None),
                "missing host in conf",
            );

            let no_user = strip(&["user", "first_user", "second_user"]);
            assert_config_error(
                validate_conf_data(kind, Some(&no_user), None),
                "missing user in conf",
            );

            let no_cred = strip(&["password", "identity"]);
            assert_config_error(
                validate_conf_data(kind, Some(&no_cred), None),
                "missing password or identity in conf",
            );
        }
    }

    #[test]
    fn categories_may_come_from_either_payload() {
        let sys = json!({"host": "h.example.org"});
        let user = json!({"user": "alice", "password": "pw"});
        validate_conf_data(ComputingKind::Remote, Some(&sys), Some(&user)).unwrap();
    }

    #[test]
    fn resource_level_value_wins() {
        let conf = ResourceConf::new(
            Some(json!({"host": "admin.example.org"})),
            Some(json!({"host": "evil.example.org", "user": "alice", "port": 2222})),
        );
        assert_eq!(conf.param("host").as_deref(), Some("admin.example.org"));
        assert_eq!(conf.param("user").as_deref(), Some("alice"));
        assert_eq!(conf.param("port").as_deref(), Some("2222"));
        assert_eq!(conf.param_sys_only("user"), None);
        assert!(matches!(
            conf.require("master"),
            Err(TetherError::Configuration(msg)) if msg == "missing master in conf"
        ));
    }

    #[test]
    fn empty_strings_are_missing() {
        let conf = ResourceConf::new(Some(json!({"host": "  "})), Some(json!({"host": "h"})));
        assert_eq!(conf.param("host").as_deref(), Some("h"));
    }

    #[test]
    fn attach_rejects_user_conf_on_foreign_private_resource() {
        let owner = Uuid::new_v4();
        let private = computing(ComputingKind::Remote, Some(owner));

        assert!(ResourceConf::attach(&private, owner, None, Some(json!({}))).is_ok());
        assert!(ResourceConf::attach(&private, Uuid::new_v4(), None, None).is_ok());
        assert!(matches!(
            ResourceConf::attach(&private, Uuid::new_v4(), None, Some(json!({}))),
            Err(TetherError::Configuration(_))
        ));

        let shared = computing(ComputingKind::Remote, None);
        assert!(ResourceConf::attach(&shared, Uuid::new_v4(), None, Some(json!({}))).is_ok());
    }

    #[test]
    fn binds_from_user_payload_only_for_owned_resources() {
        let owner = Uuid::new_v4();
        let conf = ResourceConf::new(None, Some(json!({"binds": "/scratch:/scratch"})));

        let owned = computing(ComputingKind::Remote, Some(owner));
        assert_eq!(
            binds_for(&conf, &owned, owner, Some("/data:/data")),
            vec!["/scratch:/scratch", "/data:/data"]
        );

        let shared = computing(ComputingKind::Remote, None);
        assert_eq!(binds_for(&conf, &shared, owner, Some("/data:/data")), vec!["/data:/data"]);

        let admin = ResourceConf::new(Some(json!({"binds": "/shared:/shared, /opt:/opt"})), None);
        assert_eq!(
            binds_for(&admin, &shared, owner, None),
            vec!["/shared:/shared", "/opt:/opt"]
        );
    }
}
