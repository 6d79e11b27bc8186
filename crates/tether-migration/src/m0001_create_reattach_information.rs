use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ReattachInformation::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ReattachInformation::InstanceId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::AccessIdentifier)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::ProcessId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ReattachInformation::Port).integer().not_null())
                    .col(ColumnDef::new(ReattachInformation::TopicPort).integer().null())
                    .col(
                        ColumnDef::new(ReattachInformation::RebootState)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::EngineVersion)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::CompileJobId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::ArtifactDirectory)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::ArtifactName)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::TopicRequestTimeoutMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::InteropVersion)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::SecurityLevel)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::Visibility)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::CustomCommandsJson)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::LaunchedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReattachInformation::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ReattachInformation::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ReattachInformation {
    Table,
    InstanceId,
    AccessIdentifier,
    ProcessId,
    Port,
    TopicPort,
    RebootState,
    EngineVersion,
    CompileJobId,
    ArtifactDirectory,
    ArtifactName,
    TopicRequestTimeoutMs,
    InteropVersion,
    SecurityLevel,
    Visibility,
    CustomCommandsJson,
    LaunchedAt,
    UpdatedAt,
}
