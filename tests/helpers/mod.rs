pub mod builders;
pub mod db;

pub use builders::{DeviceBuilder, ProjectBuilder, UserBuilder};
pub use db::TestDb;
