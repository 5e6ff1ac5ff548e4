//! `opsclaw operations`: List the operations a caller may use.

use opsclaw_agent::Assistant;
use opsclaw_catalog::{DefinitionFilter, OperationSummary};
use std::path::Path;

pub async fn run(config_path: Option<&Path>, roles: Vec<String>) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let assistant = Assistant::from_config(&config).await?;
    let operations = assistant.catalog().summaries_for(&roles, &DefinitionFilter::default());

    if operations.is_empty() {
        println!("No operations available.");
        return Ok(());
    }
    for line in render(&operations) {
        println!("{line}");
    }
    println!();
    println!("{} operation(s)", operations.len());
    Ok(())
}

fn render(operations: &[OperationSummary]) -> Vec<String> {
    let width = operations.iter().map(|o| o.name.len()).max().unwrap_or(0);
    operations
        .iter()
        .map(|op| {
            let kind = format!("{:?}", op.kind).to_lowercase();
            let flag = if op.requires_confirmation { " [confirm]" } else { "" };
            format!("{:width$}  {:7}  {}{flag}", op.name, kind, op.description)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsclaw_catalog::{OperationCatalog, builtin};

    #[test]
    fn renders_one_line_per_operation() {
        let catalog = OperationCatalog::new();
        builtin::register_defaults(&catalog).unwrap();
        let lines = render(&catalog.summaries_for(&[], &DefinitionFilter::default()));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("echo"));
        assert!(lines[1].contains("query"));
    }
}
