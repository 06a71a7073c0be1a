use envkit::storage::{self, DeviceRegistration, NewUser};
use sea_orm::DatabaseConnection;

/// Builder for creating test users
pub struct UserBuilder {
    auth_id: String,
    name: String,
    email: String,
}

impl UserBuilder {
    pub fn new(auth_id: &str) -> Self {
        Self {
            auth_id: auth_id.to_string(),
            name: "Test User".to_string(),
            email: format!("{auth_id}@example.com"),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = email.to_string();
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::User {
        let id = storage::create_user(
            db,
            NewUser {
                auth_id: self.auth_id,
                name: self.name,
                email: self.email,
            },
        )
        .await
        .expect("Failed to create test user");

        storage::get_user(db, &id)
            .await
            .expect("Failed to get user")
            .expect("User not found")
    }
}

/// Builder for creating test projects
pub struct ProjectBuilder {
    name: String,
    owner_id: String,
}

impl ProjectBuilder {
    pub fn new(owner_id: &str) -> Self {
        Self {
            name: "api".to_string(),
            owner_id: owner_id.to_string(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::Project {
        storage::create_project(db, &self.name, &self.owner_id)
            .await
            .expect("Failed to create test project")
    }
}

/// Builder for registering test devices
pub struct DeviceBuilder {
    registration: DeviceRegistration,
}

impl DeviceBuilder {
    pub fn new(device_id: &str, user_id: &str) -> Self {
        Self {
            registration: DeviceRegistration {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                device_name: None,
                platform: "linux".to_string(),
                arch: "x64".to_string(),
                username: "tester".to_string(),
                runtime_version: "v20.11.0".to_string(),
                cli_version: "1.0.0".to_string(),
            },
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.registration.device_name = Some(name.to_string());
        self
    }

    pub fn with_cli_version(mut self, version: &str) -> Self {
        self.registration.cli_version = version.to_string();
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::Device {
        let device_id = self.registration.device_id.clone();
        storage::register_device(db, self.registration)
            .await
            .expect("Failed to register test device");

        storage::get_device(db, &device_id)
            .await
            .expect("Failed to get device")
            .expect("Device not found")
    }
}
