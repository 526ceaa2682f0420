//! Database migrations for the posture analysis service.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_analysis_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m2026_10_01_000001_create_analysis_jobs::Migration)]
    }
}
