use envkit::settings::Settings;
use envkit::web::AppState;
use migration::MigratorTrait;
use sea_orm::{Database, DatabaseConnection};
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Application state over this database, with the bridge pointed at loopback
    pub fn app_state(&self) -> AppState {
        let mut settings = Settings::default();
        settings.bridge.cli_host = "127.0.0.1".to_string();
        settings.bridge.timeout_secs = 2;
        AppState::new(settings, self.connection.clone()).expect("Failed to build app state")
    }
}
