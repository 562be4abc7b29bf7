use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::{now_ms, validate_name, validate_text};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryChanges {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceChanges {
    pub name: Option<String>,
    pub category_id: Option<Option<Ulid>>,
    pub status: Option<ResourceStatus>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectChanges {
    pub name: Option<String>,
    pub manager: Option<Option<String>>,
    pub status: Option<ProjectStatus>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub role: Option<Role>,
    pub status: Option<UserStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserChanges {
    pub username: Option<String>,
    pub password: Option<String>,
    pub role: Option<Role>,
    pub status: Option<UserStatus>,
}

fn overlay<T: Clone>(change: &Option<T>, current: &T) -> T {
    change.as_ref().unwrap_or(current).clone()
}

fn validate_password(password: &str) -> Result<(), EngineError> {
    if password.is_empty() {
        return Err(EngineError::validation("password must not be empty"));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(EngineError::LimitExceeded("password too long"));
    }
    Ok(())
}

impl Engine {
    // ── Categories ───────────────────────────────────────

    pub async fn create_category(
        &self,
        id: Ulid,
        name: String,
        description: Option<String>,
    ) -> Result<Category, EngineError> {
        validate_name("name", &name)?;
        validate_text(description.as_deref())?;
        let _catalog = self.catalog_lock.write().await;
        if self.categories.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let category = Category {
            id,
            name,
            description,
        };
        self.persist_catalog(&Event::CategoryCreated {
            category: category.clone(),
        })
        .await?;
        info!("category {id} created");
        Ok(category)
    }

    pub async fn update_category(
        &self,
        id: Ulid,
        changes: CategoryChanges,
    ) -> Result<Category, EngineError> {
        if let Some(name) = &changes.name {
            validate_name("name", name)?;
        }
        if let Some(description) = &changes.description {
            validate_text(description.as_deref())?;
        }
        let _catalog = self.catalog_lock.write().await;
        let current = self.get_category(id)?;
        let category = Category {
            id,
            name: overlay(&changes.name, &current.name),
            description: overlay(&changes.description, &current.description),
        };
        self.persist_catalog(&Event::CategoryUpdated {
            category: category.clone(),
        })
        .await?;
        Ok(category)
    }

    /// Refused while any resource still belongs to the category.
    pub async fn delete_category(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        if !self.categories.contains_key(&id) {
            return Err(EngineError::not_found("category", id));
        }
        let in_use = self
            .list_resources()
            .await
            .iter()
            .any(|r| r.category_id == Some(id));
        if in_use {
            return Err(EngineError::Constraint(format!(
                "category {id} is still referenced by resources"
            )));
        }
        self.persist_catalog(&Event::CategoryDeleted { id }).await?;
        info!("category {id} deleted");
        Ok(())
    }

    pub fn get_category(&self, id: Ulid) -> Result<Category, EngineError> {
        self.categories
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| EngineError::not_found("category", id))
    }

    pub fn list_categories(&self) -> Vec<Category> {
        let mut out: Vec<Category> = self.categories.iter().map(|c| c.value().clone()).collect();
        out.sort_by_key(|c| c.id);
        out
    }

    fn require_category(&self, category_id: Option<Ulid>) -> Result<(), EngineError> {
        match category_id {
            Some(cid) if !self.categories.contains_key(&cid) => {
                Err(EngineError::not_found("category", cid))
            }
            _ => Ok(()),
        }
    }

    // ── Resources ────────────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        category_id: Option<Ulid>,
        status: Option<ResourceStatus>,
        description: Option<String>,
    ) -> Result<Resource, EngineError> {
        validate_name("name", &name)?;
        validate_text(description.as_deref())?;
        let _catalog = self.catalog_lock.write().await;
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.require_category(category_id)?;

        let now = now_ms();
        let resource = Resource {
            id,
            name,
            category_id,
            status: status.unwrap_or_default(),
            description,
            created_at: now,
            updated_at: now,
        };
        self.persist_catalog(&Event::ResourceCreated {
            resource: resource.clone(),
        })
        .await?;
        info!("resource {id} created");
        Ok(resource)
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        changes: ResourceChanges,
    ) -> Result<Resource, EngineError> {
        if let Some(name) = &changes.name {
            validate_name("name", name)?;
        }
        if let Some(description) = &changes.description {
            validate_text(description.as_deref())?;
        }
        let _catalog = self.catalog_lock.write().await;
        let rs = self
            .get_resource(&id)
            .ok_or_else(|| EngineError::not_found("resource", id))?;
        let mut guard = rs.write().await;
        if let Some(category_id) = changes.category_id {
            self.require_category(category_id)?;
        }
        let current = &guard.resource;
        let resource = Resource {
            id,
            name: overlay(&changes.name, &current.name),
            category_id: overlay(&changes.category_id, &current.category_id),
            status: overlay(&changes.status, &current.status),
            description: overlay(&changes.description, &current.description),
            created_at: current.created_at,
            updated_at: now_ms(),
        };
        let event = Event::ResourceUpdated {
            resource: resource.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("resource {id} updated");
        Ok(resource)
    }

    /// Refused while the resource still owns allocations or maintenance windows.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        let rs = self
            .get_resource(&id)
            .ok_or_else(|| EngineError::not_found("resource", id))?;
        let mut guard = rs.write().await;
        if guard.interval_count() > 0 {
            return Err(EngineError::Constraint(format!(
                "resource {id} still has {} allocations and {} maintenance windows",
                guard.allocations.len(),
                guard.windows.len()
            )));
        }
        self.persist_catalog(&Event::ResourceDeleted { id }).await?;
        guard.deleted = true;
        info!("resource {id} deleted");
        Ok(())
    }

    pub async fn get_resource_record(&self, id: Ulid) -> Result<Resource, EngineError> {
        let rs = self
            .get_resource(&id)
            .ok_or_else(|| EngineError::not_found("resource", id))?;
        let guard = rs.read().await;
        Ok(guard.resource.clone())
    }

    pub async fn list_resources(&self) -> Vec<Resource> {
        let states: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for rs in states {
            out.push(rs.read().await.resource.clone());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    // ── Projects ─────────────────────────────────────────

    pub async fn create_project(
        &self,
        id: Ulid,
        name: String,
        manager: Option<String>,
        status: Option<ProjectStatus>,
        description: Option<String>,
    ) -> Result<Project, EngineError> {
        validate_name("name", &name)?;
        validate_text(manager.as_deref())?;
        validate_text(description.as_deref())?;
        let _catalog = self.catalog_lock.write().await;
        if self.projects.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let now = now_ms();
        let project = Project {
            id,
            name,
            manager,
            status: status.unwrap_or_default(),
            description,
            created_at: now,
            updated_at: now,
        };
        self.persist_catalog(&Event::ProjectCreated {
            project: project.clone(),
        })
        .await?;
        info!("project {id} created");
        Ok(project)
    }

    pub async fn update_project(
        &self,
        id: Ulid,
        changes: ProjectChanges,
    ) -> Result<Project, EngineError> {
        if let Some(name) = &changes.name {
            validate_name("name", name)?;
        }
        for text in [&changes.manager, &changes.description].into_iter().flatten() {
            validate_text(text.as_deref())?;
        }
        let _catalog = self.catalog_lock.write().await;
        let current = self.get_project(id)?;
        let project = Project {
            id,
            name: overlay(&changes.name, &current.name),
            manager: overlay(&changes.manager, &current.manager),
            status: overlay(&changes.status, &current.status),
            description: overlay(&changes.description, &current.description),
            created_at: current.created_at,
            updated_at: now_ms(),
        };
        self.persist_catalog(&Event::ProjectUpdated {
            project: project.clone(),
        })
        .await?;
        info!("project {id} updated");
        Ok(project)
    }

    /// Refused while any allocation, in any status, references the project.
    pub async fn delete_project(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        if !self.projects.contains_key(&id) {
            return Err(EngineError::not_found("project", id));
        }
        let referenced = self.list_allocations_by_project(id).await.len();
        if referenced > 0 {
            return Err(EngineError::Constraint(format!(
                "project {id} is still referenced by {referenced} allocations"
            )));
        }
        self.persist_catalog(&Event::ProjectDeleted { id }).await?;
        info!("project {id} deleted");
        Ok(())
    }

    pub fn get_project(&self, id: Ulid) -> Result<Project, EngineError> {
        self.projects
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| EngineError::not_found("project", id))
    }

    pub fn list_projects(&self) -> Vec<Project> {
        let mut out: Vec<Project> = self.projects.iter().map(|p| p.value().clone()).collect();
        out.sort_by_key(|p| p.id);
        out
    }

    // ── Users ────────────────────────────────────────────

    fn require_username_free(&self, username: &str, owner: Ulid) -> Result<(), EngineError> {
        match self.usernames.get(username) {
            Some(existing) if *existing.value() != owner => Err(EngineError::Constraint(format!(
                "username {username} is already taken"
            ))),
            _ => Ok(()),
        }
    }

    pub async fn create_user(&self, id: Ulid, new: NewUser) -> Result<User, EngineError> {
        validate_name("username", &new.username)?;
        validate_password(&new.password)?;
        let _catalog = self.catalog_lock.write().await;
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.require_username_free(&new.username, id)?;
        let user = User {
            id,
            username: new.username,
            password: new.password,
            role: new.role.unwrap_or_default(),
            status: new.status.unwrap_or_default(),
        };
        self.persist_catalog(&Event::UserCreated { user: user.clone() })
            .await?;
        info!("user {} created with role {}", user.username, user.role);
        Ok(user)
    }

    pub async fn update_user(&self, id: Ulid, changes: UserChanges) -> Result<User, EngineError> {
        if let Some(username) = &changes.username {
            validate_name("username", username)?;
        }
        if let Some(password) = &changes.password {
            validate_password(password)?;
        }
        let _catalog = self.catalog_lock.write().await;
        let current = self
            .users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or_else(|| EngineError::not_found("user", id))?;
        if let Some(username) = &changes.username {
            self.require_username_free(username, id)?;
        }
        let user = User {
            id,
            username: overlay(&changes.username, &current.username),
            password: overlay(&changes.password, &current.password),
            role: overlay(&changes.role, &current.role),
            status: overlay(&changes.status, &current.status),
        };
        self.persist_catalog(&Event::UserUpdated { user: user.clone() })
            .await?;
        info!("user {} updated", user.username);
        Ok(user)
    }

    /// Every user, ordered by id. Callers must not expose `password`.
    pub fn list_users(&self) -> Vec<User> {
        let mut out: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        out.sort_by_key(|u| u.id);
        out
    }

    fn active_user(&self, username: &str) -> Option<User> {
        let id = *self.usernames.get(username)?.value();
        let user = self.users.get(&id)?.value().clone();
        (user.status == UserStatus::Active).then_some(user)
    }

    /// Session lookup: the caller behind a login name, if the account is active.
    pub fn authenticate(&self, username: &str) -> Option<AuthUser> {
        self.active_user(username).map(|u| AuthUser {
            id: u.id,
            username: u.username,
            role: u.role,
        })
    }

    /// Stored password of an active account, for the login handshake.
    pub fn password_for(&self, username: &str) -> Option<String> {
        self.active_user(username).map(|u| u.password)
    }

    /// Create the configured admin account unless that username already exists.
    /// Returns whether a user was created.
    pub async fn ensure_admin(&self, username: &str, password: &str) -> Result<bool, EngineError> {
        if self.usernames.contains_key(username) {
            return Ok(false);
        }
        let new = NewUser {
            username: username.to_string(),
            password: password.to_string(),
            role: Some(Role::Admin),
            status: Some(UserStatus::Active),
        };
        match self.create_user(Ulid::new(), new).await {
            Ok(_) => Ok(true),
            // Lost a race with another creator of the same name.
            Err(EngineError::Constraint(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
