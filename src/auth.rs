use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::engine::Engine;
use crate::model::{AuthUser, Role};
use crate::observability;
use crate::sql::Command;

/// Looks login names up in the user catalog. Unknown and disabled accounts
/// have no password, so the cleartext handshake rejects them.
pub struct BerthAuthSource {
    engine: Arc<Engine>,
}

impl fmt::Debug for BerthAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BerthAuthSource").finish_non_exhaustive()
    }
}

impl BerthAuthSource {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl AuthSource for BerthAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let username = login.user().unwrap_or_default();
        match self.engine.password_for(username) {
            Some(password) => Ok(Password::new(None, password.into_bytes())),
            None => {
                tracing::warn!("login refused for {username:?}");
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28P01".into(),
                    format!("password authentication failed for user \"{username}\""),
                ))))
            }
        }
    }
}

/// A caller asked for something its role may not do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDenied {
    pub username: String,
    pub action: &'static str,
}

impl fmt::Display for PermissionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permission denied: {} may not {}", self.username, self.action)
    }
}

impl std::error::Error for PermissionDenied {}

/// ADMIN may do everything. USER may read anything but the user list,
/// create allocations and run conflict checks.
pub fn authorize(user: &AuthUser, cmd: &Command) -> Result<(), PermissionDenied> {
    if user.role == Role::Admin {
        return Ok(());
    }
    let allowed = match cmd {
        Command::SelectUsers => false,
        Command::InsertAllocation { .. } | Command::CheckConflict { .. } => true,
        other => other.is_read(),
    };
    if allowed {
        Ok(())
    } else {
        Err(PermissionDenied {
            username: user.username.clone(),
            action: crate::observability::command_label(cmd),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parse_sql;
    use ulid::Ulid;

    fn user(role: Role) -> AuthUser {
        AuthUser {
            id: Ulid::new(),
            username: "sam".into(),
            role,
        }
    }

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn admin_may_do_everything() {
        let admin = user(Role::Admin);
        for sql in [
            "SELECT * FROM users".to_string(),
            format!("DELETE FROM resources WHERE id = '{ID}'"),
            format!("UPDATE allocations SET status = 'cancelled' WHERE id = '{ID}'"),
            format!("INSERT INTO maintenance_windows (resource_id, start, \"end\") VALUES ('{ID}', 1, 2)"),
        ] {
            assert!(authorize(&admin, &parse_sql(&sql).unwrap()).is_ok(), "{sql}");
        }
    }

    #[test]
    fn user_may_read_allocate_and_check() {
        let u = user(Role::User);
        for sql in [
            "SELECT * FROM allocations".to_string(),
            "SELECT * FROM resources".to_string(),
            "SELECT * FROM maintenance_windows".to_string(),
            format!("SELECT * FROM schedule WHERE resource_id = '{ID}' AND start >= 1 AND \"end\" <= 2"),
            format!("SELECT * FROM conflicts WHERE resource_id = '{ID}' AND start >= 1 AND \"end\" <= 2"),
            format!("INSERT INTO allocations (resource_id, project_id, start, \"end\") VALUES ('{ID}', '{ID}', 1, 2)"),
        ] {
            assert!(authorize(&u, &parse_sql(&sql).unwrap()).is_ok(), "{sql}");
        }
    }

    #[test]
    fn user_is_refused_writes_and_user_listing() {
        let u = user(Role::User);
        for sql in [
            "SELECT * FROM users".to_string(),
            format!("UPDATE allocations SET start = 1 WHERE id = '{ID}'"),
            format!("UPDATE allocations SET status = 'cancelled' WHERE id = '{ID}'"),
            format!("DELETE FROM allocations WHERE id = '{ID}'"),
            format!("INSERT INTO maintenance_windows (resource_id, start, \"end\") VALUES ('{ID}', 1, 2)"),
            format!("INSERT INTO projects (name) VALUES ('p')"),
        ] {
            let err = authorize(&u, &parse_sql(&sql).unwrap()).unwrap_err();
            assert_eq!(err.username, "sam");
        }
    }

    #[test]
    fn denial_names_the_action() {
        let err = authorize(&user(Role::User), &parse_sql("SELECT * FROM users").unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "permission denied: sam may not select_users");
    }

    #[tokio::test]
    async fn debug_hides_the_engine() {
        let dir = std::env::temp_dir().join("berth_test_auth");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("debug.wal");
        let _ = std::fs::remove_file(&path);
        let source = BerthAuthSource::new(Arc::new(Engine::new(path).unwrap()));
        assert_eq!(format!("{source:?}"), "BerthAuthSource { .. }");
    }
}
