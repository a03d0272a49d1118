use anyhow::{Result, Context as AnyhowContext};
use std::fs;
use std::path::Path;
use crate::dsl::WorkflowDefinition;

/// Load a definition from a YAML file. JSON is valid YAML, so `.json` files load too.
pub fn load_definition_from_yaml<P: AsRef<Path>>(file_path: P) -> Result<WorkflowDefinition> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read workflow file from {}", file_path.display()))?;

    parse_definition(&yaml_content)
        .with_context(|| format!("Failed to deserialize workflow from {}", file_path.display()))
}

pub fn parse_definition(content: &str) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = serde_yaml::from_str(content)?;
    Ok(definition)
}
