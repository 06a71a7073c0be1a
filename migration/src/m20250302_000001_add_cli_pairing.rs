use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create devices table (one row per CLI installation)
        manager
            .create_table(
                Table::create()
                    .table(Devices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Devices::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Devices::DeviceId))
                    .col(string(Devices::UserId))
                    .col(string_null(Devices::DeviceName))
                    .col(string(Devices::Platform))
                    .col(string(Devices::Arch))
                    .col(string(Devices::Username))
                    .col(string(Devices::RuntimeVersion))
                    .col(string(Devices::CliVersion))
                    .col(big_integer(Devices::CreatedAt))
                    .col(big_integer(Devices::LastUsedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_device_id")
                    .table(Devices::Table)
                    .col(Devices::DeviceId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_user")
                    .table(Devices::Table)
                    .col(Devices::UserId)
                    .to_owned(),
            )
            .await?;

        // Create cli_sessions table for the device pairing handshake
        manager
            .create_table(
                Table::create()
                    .table(CliSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CliSessions::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(CliSessions::DeviceId))
                    .col(string_null(CliSessions::UserId))
                    .col(string(CliSessions::Token))
                    .col(
                        ColumnDef::new(CliSessions::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(big_integer(CliSessions::CreatedAt))
                    .col(big_integer(CliSessions::ExpiresAt))
                    .col(big_integer(CliSessions::LastUsedAt))
                    .col(string_null(CliSessions::UserAgent))
                    .col(string_null(CliSessions::LastAction))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_cli_sessions_device_id")
                    .table(CliSessions::Table)
                    .col(CliSessions::DeviceId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_cli_sessions_token")
                    .table(CliSessions::Table)
                    .col(CliSessions::Token)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_cli_sessions_status")
                    .table(CliSessions::Table)
                    .col(CliSessions::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CliSessions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Devices::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Devices {
    Table,
    Id,
    DeviceId,
    UserId,
    DeviceName,
    Platform,
    Arch,
    Username,
    RuntimeVersion,
    CliVersion,
    CreatedAt,
    LastUsedAt,
}

#[derive(DeriveIden)]
enum CliSessions {
    Table,
    Id,
    DeviceId,
    UserId,
    Token,
    Status,
    CreatedAt,
    ExpiresAt,
    LastUsedAt,
    UserAgent,
    LastAction,
}
