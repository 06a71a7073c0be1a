use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create users table
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Users::AuthId))
                    .col(string(Users::Name))
                    .col(string(Users::Email))
                    .col(big_integer(Users::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_auth_id")
                    .table(Users::Table)
                    .col(Users::AuthId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_email")
                    .table(Users::Table)
                    .col(Users::Email)
                    .to_owned(),
            )
            .await?;

        // Create projects table
        manager
            .create_table(
                Table::create()
                    .table(Projects::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Projects::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Projects::Name))
                    .col(string(Projects::OwnerId))
                    .col(big_integer(Projects::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_projects_owner")
                    .table(Projects::Table)
                    .col(Projects::OwnerId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_projects_owner_name")
                    .table(Projects::Table)
                    .col(Projects::OwnerId)
                    .col(Projects::Name)
                    .to_owned(),
            )
            .await?;

        // Create variables table
        manager
            .create_table(
                Table::create()
                    .table(Variables::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Variables::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Variables::ProjectId))
                    .col(string(Variables::Name))
                    .col(string(Variables::Value))
                    .col(
                        ColumnDef::new(Variables::Stage)
                            .string()
                            .not_null()
                            .default("production"),
                    )
                    .col(string_null(Variables::Branch))
                    .col(big_integer(Variables::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_variables_project")
                    .table(Variables::Table)
                    .col(Variables::ProjectId)
                    .to_owned(),
            )
            .await?;

        // Name uniqueness is checked before insert, so this stays a plain index
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_variables_project_name")
                    .table(Variables::Table)
                    .col(Variables::ProjectId)
                    .col(Variables::Name)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Variables::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Projects::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    AuthId,
    Name,
    Email,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Projects {
    Table,
    Id,
    Name,
    OwnerId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Variables {
    Table,
    Id,
    ProjectId,
    Name,
    Value,
    Stage,
    Branch,
    CreatedAt,
}
