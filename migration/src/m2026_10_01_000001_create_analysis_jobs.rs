//! Migration to create the analysis_jobs table.
//!
//! Each row is one posture analysis request: the uploaded media it points at,
//! the attempt currently driving it, its lifecycle status and the final report.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AnalysisJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AnalysisJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AnalysisJobs::AttemptId).uuid().not_null())
                    .col(
                        ColumnDef::new(AnalysisJobs::Attempts)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::StatusText)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(AnalysisJobs::ErrorMessage).text().null())
                    .col(ColumnDef::new(AnalysisJobs::MediaKind).text().not_null())
                    .col(ColumnDef::new(AnalysisJobs::MediaReference).text().not_null())
                    .col(
                        ColumnDef::new(AnalysisJobs::MediaItems)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::OriginalFilename)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AnalysisJobs::ContentType).text().not_null())
                    .col(
                        ColumnDef::new(AnalysisJobs::EngineFileReference)
                            .text()
                            .null(),
                    )
                    .col(ColumnDef::new(AnalysisJobs::Report).json_binary().null())
                    .col(
                        ColumnDef::new(AnalysisJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AnalysisJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // History listing reads newest first
        manager
            .create_index(
                Index::create()
                    .name("idx_analysis_jobs_created_at")
                    .table(AnalysisJobs::Table)
                    .col(AnalysisJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_analysis_jobs_status")
                    .table(AnalysisJobs::Table)
                    .col(AnalysisJobs::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_analysis_jobs_status")
                    .table(AnalysisJobs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_analysis_jobs_created_at")
                    .table(AnalysisJobs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(AnalysisJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AnalysisJobs {
    Table,
    Id,
    AttemptId,
    Attempts,
    Status,
    StatusText,
    ErrorMessage,
    MediaKind,
    MediaReference,
    MediaItems,
    OriginalFilename,
    ContentType,
    EngineFileReference,
    Report,
    CreatedAt,
    UpdatedAt,
}
