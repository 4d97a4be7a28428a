//! Integration listing and health checks.
//!
//! An integration is healthy when its schemas parse and its credential can
//! be resolved. Nothing is fetched.

use anyhow::Result;
use serde::Serialize;

use crate::config::{Config, IntegrationConfig};
use crate::fetch::FetchRequest;
use crate::pipeline::Schemas;

#[derive(Debug, Clone, Serialize)]
pub struct IntegrationStatus {
    pub name: String,
    pub collection: String,
    pub save: bool,
    pub auto: bool,
    pub healthy: bool,
    /// First problem found, when unhealthy.
    pub problem: Option<String>,
}

pub fn check(integration: &IntegrationConfig) -> IntegrationStatus {
    let problem = match Schemas::parse(integration) {
        Err(e) => Some(e.to_string()),
        Ok(_) => FetchRequest::for_integration(integration, integration.params.clone())
            .credential()
            .err()
            .map(|e| e.to_string()),
    };
    IntegrationStatus {
        name: integration.name.clone(),
        collection: integration.collection().to_string(),
        save: integration.save,
        auto: integration.auto_pipeline.is_some(),
        healthy: problem.is_none(),
        problem,
    }
}

pub fn list_integrations(config: &Config) -> Result<()> {
    if config.integrations.is_empty() {
        println!("No integrations configured.");
        return Ok(());
    }

    println!(
        "{:<20} {:<20} {:<6} {:<6} HEALTHY",
        "INTEGRATION", "COLLECTION", "SAVE", "AUTO"
    );
    for integration in config.integrations.values() {
        let status = check(integration);
        println!(
            "{:<20} {:<20} {:<6} {:<6} {}",
            status.name, status.collection, status.save, status.auto, status.healthy
        );
        if let Some(problem) = &status.problem {
            println!("  {}", problem);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config(extra: &str) -> Config {
        crate::config::parse_config(
            &format!("[db]\npath = \"x.sqlite\"\n{}", extra),
            Path::new("."),
        )
        .unwrap()
    }

    #[test]
    fn test_healthy_integration() {
        let config = config(
            "[integrations.prices]\nurl = \"http://x\"\nmapping_schema = '{\"@id\":\"id\"}'\nsave = true\n",
        );
        let status = check(&config.integrations["prices"]);
        assert!(status.healthy);
        assert!(status.save);
        assert!(!status.auto);
    }

    #[test]
    fn test_bad_schema_is_unhealthy() {
        let config = config("[integrations.prices]\nurl = \"http://x\"\nmapping_schema = '[1, 2]'\n");
        let status = check(&config.integrations["prices"]);
        assert!(!status.healthy);
        assert!(status.problem.unwrap().contains("mapping schema"));
    }

    #[test]
    fn test_missing_credential_is_unhealthy() {
        let config = config(
            "[integrations.prices]\nurl = \"http://x\"\nauth = { mode = \"bearer\", credential_env = \"MONTAINE_TEST_UNSET_VAR_9120\" }\n",
        );
        let status = check(&config.integrations["prices"]);
        assert!(!status.healthy);
        assert!(status.problem.unwrap().contains("MONTAINE_TEST_UNSET_VAR_9120"));
    }
}
