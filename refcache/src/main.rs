use anyhow::{Context, bail};
use clap::Parser;
use refcache::{Config, RepositoryRegistry, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = refcache::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.log_format)?;

    tracing::debug!("{:?}", args);

    let registry = RepositoryRegistry::from_config(&config)?;

    let Some(resource_type) = args.resource.as_deref() else {
        // Nothing to resolve: list what the configuration offers
        for resource_type in registry.resource_types() {
            println!("{resource_type}");
        }
        return Ok(());
    };
    if args.ids.is_empty() {
        bail!("no IDs given to resolve for resource type '{resource_type}'");
    }

    let repository = registry.get(resource_type)?;
    let resolved = repository
        .resolve(&args.ids, config.resolve_timeout)
        .await
        .with_context(|| format!("failed to resolve {} {resource_type} ID(s)", args.ids.len()))?;

    // Keep the order the IDs were given in
    let output: Vec<serde_json::Value> = args
        .ids
        .iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "reference": resolved.get(id).cloned().flatten(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&output)?);

    registry.shutdown();
    Ok(())
}
