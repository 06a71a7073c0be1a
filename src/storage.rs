use crate::entities;
use crate::errors::EnvkitError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use rand::RngCore;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_VARIABLE_NAME_LEN: usize = 50;
const MAX_VARIABLE_VALUE_LEN: usize = 100;

/// Deployment classification of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Development,
    Staging,
    #[default]
    Production,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Development => "development",
            Stage::Staging => "staging",
            Stage::Production => "production",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = EnvkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Stage::Development),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            other => Err(EnvkitError::BadRequest(format!("Unknown stage: {other}"))),
        }
    }
}

/// Lifecycle state of a CLI pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Authenticated,
    Revoked,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Revoked => "revoked",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = EnvkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "authenticated" => Ok(SessionStatus::Authenticated),
            "revoked" => Ok(SessionStatus::Revoked),
            other => Err(EnvkitError::Other(format!("Unknown session status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub auth_id: String,
    pub name: String,
    pub email: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub auth_id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub value: String,
    pub stage: Stage,
    pub branch: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVariable {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableFilter {
    pub stage: Option<Stage>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectWithVariables {
    pub project: Project,
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub device_name: Option<String>,
    pub platform: String,
    pub arch: String,
    pub username: String,
    pub runtime_version: String,
    pub cli_version: String,
    pub created_at: i64,
    pub last_used_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    pub platform: String,
    pub arch: String,
    pub username: String,
    pub runtime_version: String,
    pub cli_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredDevice {
    /// Record id of the device row (not the client-generated device id)
    pub device_id: String,
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceWithSession {
    #[serde(flatten)]
    pub device: Device,
    pub has_active_session: bool,
    pub last_session_activity: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliSession {
    pub id: String,
    pub device_id: String,
    pub user_id: Option<String>,
    pub token: String,
    pub status: SessionStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_used_at: i64,
    pub user_agent: Option<String>,
    pub last_action: Option<String>,
}

impl CliSession {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedAuth {
    pub success: bool,
    pub token: String,
    pub user_id: String,
    pub session_id: String,
    pub expires_at: i64,
}

/// What a polling CLI learns about its pairing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionPoll {
    NotFound,
    Expired,
    Pending,
    Completed {
        session_id: String,
        token: String,
        user_id: String,
        expires_at: i64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TokenValidation {
    fn invalid() -> Self {
        Self::default()
    }

    fn expired() -> Self {
        Self {
            reason: Some("expired".to_string()),
            ..Self::default()
        }
    }
}

impl From<entities::user::Model> for User {
    fn from(model: entities::user::Model) -> Self {
        Self {
            id: model.id,
            auth_id: model.auth_id,
            name: model.name,
            email: model.email,
            created_at: model.created_at,
        }
    }
}

impl From<entities::project::Model> for Project {
    fn from(model: entities::project::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            owner_id: model.owner_id,
            created_at: model.created_at,
        }
    }
}

impl TryFrom<entities::variable::Model> for Variable {
    type Error = EnvkitError;

    fn try_from(model: entities::variable::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            stage: model.stage.parse()?,
            id: model.id,
            project_id: model.project_id,
            name: model.name,
            value: model.value,
            branch: model.branch,
            created_at: model.created_at,
        })
    }
}

impl From<entities::device::Model> for Device {
    fn from(model: entities::device::Model) -> Self {
        Self {
            id: model.id,
            device_id: model.device_id,
            user_id: model.user_id,
            device_name: model.device_name,
            platform: model.platform,
            arch: model.arch,
            username: model.username,
            runtime_version: model.runtime_version,
            cli_version: model.cli_version,
            created_at: model.created_at,
            last_used_at: model.last_used_at,
        }
    }
}

impl TryFrom<entities::cli_session::Model> for CliSession {
    type Error = EnvkitError;

    fn try_from(model: entities::cli_session::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            status: model.status.parse()?,
            id: model.id,
            device_id: model.device_id,
            user_id: model.user_id,
            token: model.token,
            created_at: model.created_at,
            expires_at: model.expires_at,
            last_used_at: model.last_used_at,
            user_agent: model.user_agent,
            last_action: model.last_action,
        })
    }
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, EnvkitError> {
    let db = Database::connect(&cfg.url).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Milliseconds since the Unix epoch; all stored timestamps use this unit.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Expiry timestamp `ttl_secs` after `now`, clamped rather than overflowing.
fn expiry_after(now: i64, ttl_secs: i64) -> i64 {
    now.saturating_add(ttl_secs.saturating_mul(1000))
}

fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

// User functions

/// Look up or insert a user. An existing account matched by auth id wins,
/// then one matched by normalized email; only then is a new row written.
pub async fn create_user(db: &DatabaseConnection, input: NewUser) -> Result<String, EnvkitError> {
    use entities::user::{Column, Entity};

    let auth_id = input.auth_id.trim().to_string();
    let email = input.email.trim().to_lowercase();
    let name = input.name.trim().to_string();

    if auth_id.is_empty() {
        return Err(EnvkitError::BadRequest("authId is required".to_string()));
    }

    if let Some(existing) = Entity::find()
        .filter(Column::AuthId.eq(&auth_id))
        .one(db)
        .await?
    {
        return Ok(existing.id);
    }

    if let Some(existing) = Entity::find()
        .filter(Column::Email.eq(&email))
        .one(db)
        .await?
    {
        tracing::debug!(user_id = %existing.id, "Matched existing user by email");
        return Ok(existing.id);
    }

    let id = random_id();
    let user = entities::user::ActiveModel {
        id: Set(id.clone()),
        auth_id: Set(auth_id),
        name: Set(name),
        email: Set(email),
        created_at: Set(now_millis()),
    };
    user.insert(db).await?;

    tracing::info!(user_id = %id, "Created user");
    Ok(id)
}

pub async fn get_user_by_auth_id(
    db: &DatabaseConnection,
    auth_id: &str,
) -> Result<Option<User>, EnvkitError> {
    use entities::user::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::AuthId.eq(auth_id))
        .one(db)
        .await?
        .map(User::from))
}

pub async fn get_user(db: &DatabaseConnection, id: &str) -> Result<Option<User>, EnvkitError> {
    Ok(entities::User::find_by_id(id.to_string())
        .one(db)
        .await?
        .map(User::from))
}

pub async fn get_or_create_user(
    db: &DatabaseConnection,
    input: NewUser,
) -> Result<String, EnvkitError> {
    if let Some(user) = get_user_by_auth_id(db, input.auth_id.trim()).await? {
        return Ok(user.id);
    }
    create_user(db, input).await
}

// Project functions

/// Create a project for `owner_id`, or return the one it already owns under that name.
pub async fn create_project(
    db: &DatabaseConnection,
    name: &str,
    owner_id: &str,
) -> Result<Project, EnvkitError> {
    use entities::project::{Column, Entity};

    if name.trim().is_empty() {
        return Err(EnvkitError::BadRequest("Project name is required".to_string()));
    }

    if let Some(existing) = Entity::find()
        .filter(Column::OwnerId.eq(owner_id))
        .filter(Column::Name.eq(name))
        .one(db)
        .await?
    {
        tracing::debug!(project_id = %existing.id, "Project exists");
        return Ok(existing.into());
    }

    let project = entities::project::ActiveModel {
        id: Set(random_id()),
        name: Set(name.to_string()),
        owner_id: Set(owner_id.to_string()),
        created_at: Set(now_millis()),
    };
    let model = project.insert(db).await?;

    Ok(model.into())
}

pub async fn list_projects(
    db: &DatabaseConnection,
    owner_id: &str,
) -> Result<Vec<Project>, EnvkitError> {
    use entities::project::{Column, Entity};

    let models = Entity::find()
        .filter(Column::OwnerId.eq(owner_id))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?;

    Ok(models.into_iter().map(Project::from).collect())
}

pub async fn get_project(
    db: &DatabaseConnection,
    project_id: &str,
) -> Result<Option<Project>, EnvkitError> {
    Ok(entities::Project::find_by_id(project_id.to_string())
        .one(db)
        .await?
        .map(Project::from))
}

async fn require_project(db: &DatabaseConnection, project_id: &str) -> Result<Project, EnvkitError> {
    get_project(db, project_id)
        .await?
        .ok_or_else(|| EnvkitError::NotFound("project doesn't exist".to_string()))
}

// Variable functions

/// Check a variable's name and value, returning them trimmed.
///
/// Names are SCREAMING_SNAKE_CASE (`[A-Z0-9_]+`) of at most 50 characters;
/// values are non-empty and at most 100 characters.
pub fn validate_variable_input(name: &str, value: &str) -> Result<(String, String), EnvkitError> {
    let name = name.trim();
    let value = value.trim();

    if name.is_empty() {
        return Err(EnvkitError::BadRequest("Variable name is required".to_string()));
    }
    if name.chars().count() > MAX_VARIABLE_NAME_LEN {
        return Err(EnvkitError::BadRequest(format!(
            "Variable name must be at most {MAX_VARIABLE_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(EnvkitError::BadRequest(
            "Variable names may only contain A-Z, 0-9 and _".to_string(),
        ));
    }
    if value.is_empty() {
        return Err(EnvkitError::BadRequest("Variable value is required".to_string()));
    }
    if value.chars().count() > MAX_VARIABLE_VALUE_LEN {
        return Err(EnvkitError::BadRequest(format!(
            "Variable value must be at most {MAX_VARIABLE_VALUE_LEN} characters"
        )));
    }

    Ok((name.to_string(), value.to_string()))
}

/// Add a variable to a project. Fails without writing when the project
/// already holds a variable with the same name, whatever its stage.
pub async fn create_variable(
    db: &DatabaseConnection,
    project_id: &str,
    input: NewVariable,
) -> Result<Variable, EnvkitError> {
    use entities::variable::{Column, Entity};

    let (name, value) = validate_variable_input(&input.name, &input.value)?;
    let project = require_project(db, project_id).await?;

    let existing = Entity::find()
        .filter(Column::ProjectId.eq(&project.id))
        .filter(Column::Name.eq(&name))
        .one(db)
        .await?;

    if existing.is_some() {
        return Err(EnvkitError::Conflict(format!(
            "Variable: {} exists in project: {}",
            name, project.name
        )));
    }

    let stage = input.stage.unwrap_or_default();
    let branch = input
        .branch
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty());

    let variable = entities::variable::ActiveModel {
        id: Set(random_id()),
        project_id: Set(project.id.clone()),
        name: Set(name),
        value: Set(value),
        stage: Set(stage.as_str().to_string()),
        branch: Set(branch),
        created_at: Set(now_millis()),
    };
    let model = variable.insert(db).await?;

    tracing::info!(project_id = %project.id, variable = %model.name, %stage, "Created variable");
    Variable::try_from(model)
}

pub async fn list_variables(
    db: &DatabaseConnection,
    project_id: &str,
    filter: &VariableFilter,
) -> Result<Vec<Variable>, EnvkitError> {
    use entities::variable::{Column, Entity};

    let mut query = Entity::find().filter(Column::ProjectId.eq(project_id));
    if let Some(stage) = filter.stage {
        query = query.filter(Column::Stage.eq(stage.as_str()));
    }
    if let Some(branch) = &filter.branch {
        query = query.filter(Column::Branch.eq(branch.as_str()));
    }

    query
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?
        .into_iter()
        .map(Variable::try_from)
        .collect()
}

pub async fn get_vars_and_project(
    db: &DatabaseConnection,
    project_id: &str,
) -> Result<ProjectWithVariables, EnvkitError> {
    let project = require_project(db, project_id).await?;
    let variables = list_variables(db, &project.id, &VariableFilter::default()).await?;
    Ok(ProjectWithVariables { project, variables })
}

// Device functions

/// Insert or refresh the device row keyed by the client-generated device id.
pub async fn register_device(
    db: &DatabaseConnection,
    input: DeviceRegistration,
) -> Result<RegisteredDevice, EnvkitError> {
    use entities::device::{Column, Entity};

    let now = now_millis();

    if let Some(existing) = Entity::find()
        .filter(Column::DeviceId.eq(&input.device_id))
        .one(db)
        .await?
    {
        let id = existing.id.clone();
        let mut active: entities::device::ActiveModel = existing.into();
        active.user_id = Set(input.user_id);
        active.device_name = Set(input.device_name);
        active.platform = Set(input.platform);
        active.arch = Set(input.arch);
        active.username = Set(input.username);
        active.runtime_version = Set(input.runtime_version);
        active.cli_version = Set(input.cli_version);
        active.last_used_at = Set(now);
        active.update(db).await?;

        return Ok(RegisteredDevice {
            device_id: id,
            updated: true,
        });
    }

    let id = random_id();
    let device = entities::device::ActiveModel {
        id: Set(id.clone()),
        device_id: Set(input.device_id),
        user_id: Set(input.user_id),
        device_name: Set(input.device_name),
        platform: Set(input.platform),
        arch: Set(input.arch),
        username: Set(input.username),
        runtime_version: Set(input.runtime_version),
        cli_version: Set(input.cli_version),
        created_at: Set(now),
        last_used_at: Set(now),
    };
    device.insert(db).await?;

    Ok(RegisteredDevice {
        device_id: id,
        updated: false,
    })
}

pub async fn get_device(
    db: &DatabaseConnection,
    device_id: &str,
) -> Result<Option<Device>, EnvkitError> {
    use entities::device::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::DeviceId.eq(device_id))
        .one(db)
        .await?
        .map(Device::from))
}

pub async fn list_devices(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<Device>, EnvkitError> {
    use entities::device::{Column, Entity};

    let models = Entity::find()
        .filter(Column::UserId.eq(user_id))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?;

    Ok(models.into_iter().map(Device::from).collect())
}

/// Devices of a user, each annotated with its live authenticated session if any.
pub async fn list_user_devices(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<DeviceWithSession>, EnvkitError> {
    use entities::cli_session::{Column, Entity};

    let now = now_millis();
    let mut out = Vec::new();

    for device in list_devices(db, user_id).await? {
        let active = Entity::find()
            .filter(Column::DeviceId.eq(&device.device_id))
            .filter(Column::Status.eq(SessionStatus::Authenticated.as_str()))
            .filter(Column::ExpiresAt.gte(now))
            .order_by_desc(Column::LastUsedAt)
            .one(db)
            .await?;

        out.push(DeviceWithSession {
            has_active_session: active.is_some(),
            last_session_activity: active.map(|s| s.last_used_at),
            device,
        });
    }

    Ok(out)
}

// CLI session (device pairing) functions

/// Start a pairing attempt for `device_id`. Any pending session for the
/// device is revoked first so at most one stays pending.
pub async fn init_session(
    db: &DatabaseConnection,
    device_id: &str,
    user_agent: Option<String>,
    ttl_secs: i64,
) -> Result<CliSession, EnvkitError> {
    use entities::cli_session::{Column, Entity};

    if device_id.trim().is_empty() {
        return Err(EnvkitError::BadRequest("deviceId is required".to_string()));
    }

    let now = now_millis();

    let superseded = Entity::update_many()
        .col_expr(Column::Status, Expr::value(SessionStatus::Revoked.as_str()))
        .col_expr(Column::LastAction, Expr::value("superseded"))
        .filter(Column::DeviceId.eq(device_id))
        .filter(Column::Status.eq(SessionStatus::Pending.as_str()))
        .exec(db)
        .await?;
    if superseded.rows_affected > 0 {
        tracing::debug!(
            device_id,
            count = superseded.rows_affected,
            "Revoked superseded pending sessions"
        );
    }

    let id = random_id();
    let token = random_id();
    let expires_at = expiry_after(now, ttl_secs);

    let session = entities::cli_session::ActiveModel {
        id: Set(id.clone()),
        device_id: Set(device_id.to_string()),
        user_id: Set(None),
        token: Set(token.clone()),
        status: Set(SessionStatus::Pending.as_str().to_string()),
        created_at: Set(now),
        expires_at: Set(expires_at),
        last_used_at: Set(now),
        user_agent: Set(user_agent.clone()),
        last_action: Set(Some("init".to_string())),
    };
    session.insert(db).await?;

    tracing::info!(session_id = %id, device_id, "Created pending CLI session");

    Ok(CliSession {
        id,
        device_id: device_id.to_string(),
        user_id: None,
        token,
        status: SessionStatus::Pending,
        created_at: now,
        expires_at,
        last_used_at: now,
        user_agent,
        last_action: Some("init".to_string()),
    })
}

pub async fn get_cli_session(
    db: &DatabaseConnection,
    session_id: &str,
) -> Result<Option<CliSession>, EnvkitError> {
    entities::CliSession::find_by_id(session_id.to_string())
        .one(db)
        .await?
        .map(CliSession::try_from)
        .transpose()
}

async fn latest_pending_session(
    db: &DatabaseConnection,
    device_id: &str,
) -> Result<Option<CliSession>, EnvkitError> {
    use entities::cli_session::{Column, Entity};

    Entity::find()
        .filter(Column::DeviceId.eq(device_id))
        .filter(Column::Status.eq(SessionStatus::Pending.as_str()))
        .order_by_desc(Column::CreatedAt)
        .one(db)
        .await?
        .map(CliSession::try_from)
        .transpose()
}

async fn mark_revoked(
    db: &DatabaseConnection,
    session_id: &str,
    action: &str,
) -> Result<(), EnvkitError> {
    use entities::cli_session::{Column, Entity};

    Entity::update_many()
        .col_expr(Column::Status, Expr::value(SessionStatus::Revoked.as_str()))
        .col_expr(Column::LastAction, Expr::value(action))
        .col_expr(Column::LastUsedAt, Expr::value(now_millis()))
        .filter(Column::Id.eq(session_id))
        .exec(db)
        .await?;

    Ok(())
}

/// Bind a pending session to `user_id` once the browser side has signed in.
///
/// With `session_id` that exact session is used, otherwise the most recent
/// pending session of the device. The session gets a fresh token and the
/// long-lived expiry.
pub async fn complete_auth(
    db: &DatabaseConnection,
    device_id: &str,
    user_id: &str,
    session_id: Option<&str>,
    ttl_secs: i64,
) -> Result<CompletedAuth, EnvkitError> {
    use entities::cli_session::{Column, Entity};

    if user_id.trim().is_empty() {
        return Err(EnvkitError::BadRequest("userId is required".to_string()));
    }

    let session = match session_id {
        Some(id) => get_cli_session(db, id)
            .await?
            .filter(|s| s.device_id == device_id && s.status == SessionStatus::Pending),
        None => latest_pending_session(db, device_id).await?,
    };

    let session = session.ok_or_else(|| {
        EnvkitError::NotFound("No pending session found for this device".to_string())
    })?;

    let now = now_millis();
    if session.is_expired(now) {
        mark_revoked(db, &session.id, "expired").await?;
        tracing::info!(session_id = %session.id, device_id, "Pending CLI session expired");
        return Err(EnvkitError::Expired("Session expired".to_string()));
    }

    let token = random_id();
    let expires_at = expiry_after(now, ttl_secs);

    // Guard on status so a concurrent revoke is not overwritten
    let result = Entity::update_many()
        .col_expr(Column::UserId, Expr::value(user_id))
        .col_expr(Column::Token, Expr::value(token.as_str()))
        .col_expr(
            Column::Status,
            Expr::value(SessionStatus::Authenticated.as_str()),
        )
        .col_expr(Column::LastUsedAt, Expr::value(now))
        .col_expr(Column::ExpiresAt, Expr::value(expires_at))
        .col_expr(Column::LastAction, Expr::value("authenticate"))
        .filter(Column::Id.eq(&session.id))
        .filter(Column::Status.eq(SessionStatus::Pending.as_str()))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(EnvkitError::NotFound(
            "No pending session found for this device".to_string(),
        ));
    }

    tracing::info!(session_id = %session.id, device_id, user_id, "CLI session authenticated");

    Ok(CompletedAuth {
        success: true,
        token,
        user_id: user_id.to_string(),
        session_id: session.id,
        expires_at,
    })
}

fn poll_result(session: CliSession, now: i64) -> SessionPoll {
    if session.status == SessionStatus::Revoked {
        return SessionPoll::NotFound;
    }
    if session.is_expired(now) {
        return SessionPoll::Expired;
    }
    match (session.status, session.user_id) {
        (SessionStatus::Authenticated, Some(user_id)) => SessionPoll::Completed {
            session_id: session.id,
            token: session.token,
            user_id,
            expires_at: session.expires_at,
        },
        _ => SessionPoll::Pending,
    }
}

/// Status of a pairing session as seen by the polling CLI. Expiry is
/// evaluated here, on read; nothing sweeps expired rows.
pub async fn get_session_status(
    db: &DatabaseConnection,
    session_id: &str,
) -> Result<SessionPoll, EnvkitError> {
    Ok(match get_cli_session(db, session_id).await? {
        Some(session) => poll_result(session, now_millis()),
        None => SessionPoll::NotFound,
    })
}

/// Like [`get_session_status`] but keyed by device, using the device's most
/// recent session that has not been revoked.
pub async fn get_session_by_device(
    db: &DatabaseConnection,
    device_id: &str,
) -> Result<SessionPoll, EnvkitError> {
    use entities::cli_session::{Column, Entity};

    let session = Entity::find()
        .filter(Column::DeviceId.eq(device_id))
        .filter(Column::Status.ne(SessionStatus::Revoked.as_str()))
        .order_by_desc(Column::CreatedAt)
        .one(db)
        .await?
        .map(CliSession::try_from)
        .transpose()?;

    Ok(match session {
        Some(session) => poll_result(session, now_millis()),
        None => SessionPoll::NotFound,
    })
}

/// Check a bearer token presented by the CLI. Expired sessions are revoked
/// on the spot; valid ones get `last_used_at` refreshed.
pub async fn validate_token(
    db: &DatabaseConnection,
    token: &str,
) -> Result<TokenValidation, EnvkitError> {
    use entities::cli_session::{Column, Entity};

    if token.is_empty() {
        return Ok(TokenValidation::invalid());
    }

    let session = Entity::find()
        .filter(Column::Token.eq(token))
        .one(db)
        .await?
        .map(CliSession::try_from)
        .transpose()?;

    let session = match session {
        Some(s) if s.status == SessionStatus::Authenticated => s,
        _ => return Ok(TokenValidation::invalid()),
    };

    let now = now_millis();
    if session.is_expired(now) {
        mark_revoked(db, &session.id, "expired").await?;
        tracing::info!(session_id = %session.id, "Revoked expired CLI session");
        return Ok(TokenValidation::expired());
    }

    Entity::update_many()
        .col_expr(Column::LastUsedAt, Expr::value(now))
        .col_expr(Column::LastAction, Expr::value("validate"))
        .filter(Column::Id.eq(&session.id))
        .exec(db)
        .await?;

    Ok(TokenValidation {
        valid: true,
        reason: None,
        user_id: session.user_id,
        device_id: Some(session.device_id),
        session_id: Some(session.id),
    })
}

/// Log a CLI session out. Applies whatever state the session is in.
pub async fn revoke_session(db: &DatabaseConnection, session_id: &str) -> Result<(), EnvkitError> {
    if get_cli_session(db, session_id).await?.is_none() {
        return Err(EnvkitError::NotFound("Session not found".to_string()));
    }

    mark_revoked(db, session_id, "logout").await?;
    tracing::info!(session_id, "CLI session revoked");
    Ok(())
}
