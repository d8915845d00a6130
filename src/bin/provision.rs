//! Bootstrap: discover module schemas, reconcile them with the database and seed counters.
//!
//! Settings come from the environment (and `.env`): see `Settings::from_lookup`.

use provision_sdk::{
    AppError, CodeGenerator, ConfigError, Counter, CountersSchema, FsTreeReader, PgDatabase, Reconciler,
    SchemaRegistry, Settings,
};
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("provision_sdk=info".parse()?))
        .init();

    let settings = Settings::from_env()?;
    let db = PgDatabase::connect(&settings).await?;
    let result = bootstrap(&db, &settings).await;
    db.close().await;
    result?;
    Ok(())
}

async fn bootstrap(db: &PgDatabase, settings: &Settings) -> Result<(), AppError> {
    let mut registry = SchemaRegistry::new().with(CountersSchema);
    registry.load_tree(&settings.modules_path, &FsTreeReader)?;

    let report = Reconciler::new(db)
        .with_collation(settings.collation.clone())
        .with_mode(settings.mode)
        .run(&registry)
        .await?;
    for f in &report.failures {
        tracing::warn!("[schema] {} - {} not applied: {}", f.collection, f.step, f.message);
    }

    if let Some(path) = &settings.counters_path {
        let counters = load_counters(path).await?;
        let inserted = CodeGenerator::seed(db, &counters).await?;
        tracing::info!("seeded {} of {} counter(s)", inserted, counters.len());
    }
    Ok(())
}

async fn load_counters(path: &Path) -> Result<Vec<Counter>, AppError> {
    let load_err = |e: String| ConfigError::Load(format!("{}: {}", path.display(), e));
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| load_err(e.to_string()))?;
    let counters = serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))?;
    Ok(counters)
}
