pub mod cli_session;
pub mod device;
pub mod project;
pub mod user;
pub mod variable;

pub use cli_session::Entity as CliSession;
pub use device::Entity as Device;
pub use project::Entity as Project;
pub use user::Entity as User;
pub use variable::Entity as Variable;
