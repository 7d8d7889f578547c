//! `consultd key create`: provision an API key for local use.

use std::path::Path;

use anyhow::Context;
use console::style;
use consult_infra::sqlite::api_key::create_api_key;
use consult_infra::sqlite::pool::DatabasePool;
use consult_types::config::GlobalConfig;

use crate::state::database_url;

pub async fn create_key(
    config: &GlobalConfig,
    data_dir: &Path,
    principal: &str,
    ttl_days: Option<i64>,
    json: bool,
) -> anyhow::Result<()> {
    let principal = principal.trim();
    anyhow::ensure!(!principal.is_empty(), "principal must not be empty");
    if let Some(days) = ttl_days {
        anyhow::ensure!(days > 0, "--ttl-days must be positive");
    }

    tokio::fs::create_dir_all(data_dir).await?;
    let pool = DatabasePool::new(&database_url(config, data_dir))
        .await
        .context("failed to open database")?;
    let issued = create_api_key(&pool, principal, ttl_days.map(chrono::Duration::days)).await?;

    if json {
        let out = serde_json::json!({
            "id": issued.id,
            "key": issued.key,
            "principal": issued.principal,
            "expires_at": issued.expires_at,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} API key for '{}' (save this -- it won't be shown again):",
        style("🔑").bold(),
        style(&issued.principal).cyan()
    );
    println!();
    println!("  {}", style(&issued.key).yellow().bold());
    if let Some(expires_at) = issued.expires_at {
        println!();
        println!("  {}", style(format!("Expires {}", expires_at.to_rfc3339())).dim());
    }
    println!();
    Ok(())
}
