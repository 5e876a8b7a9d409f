use std::{fs, path::Path};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::{PipelineDefinition, PrecedenceEdge, TaskSpec, Template};
use crate::error::Result;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Toml,
}

/// Serialized form of a [`Template`], as handed to an external executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDocument {
    pub pipeline: PipelineDefinition,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub edges: Vec<PrecedenceEdge>,
}

impl ExportFormat {
    /// `.json` files are JSON, everything else is read as TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ExportFormat::Json,
            _ => ExportFormat::Toml,
        }
    }
}

impl TemplateDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents, ExportFormat::from_path(path))
    }

    pub fn render(&self, format: ExportFormat) -> Result<String> {
        let rendered = match format {
            ExportFormat::Json => serde_json::to_string_pretty(self)?,
            ExportFormat::Toml => toml::to_string_pretty(self)?,
        };
        Ok(rendered)
    }

    pub fn parse(text: &str, format: ExportFormat) -> Result<Self> {
        let document = match format {
            ExportFormat::Json => serde_json::from_str(text)?,
            ExportFormat::Toml => toml::from_str(text)?,
        };
        Ok(document)
    }
}

impl Template {
    pub fn to_document(&self) -> TemplateDocument {
        TemplateDocument {
            pipeline: self.definition().clone(),
            tasks: self.tasks().to_vec(),
            edges: self.edges().iter().cloned().collect(),
        }
    }

    /// Re-assembles a document, so an imported template is validated like a loaded one.
    pub fn from_document(document: TemplateDocument) -> Result<Self> {
        Template::assemble(document.pipeline, document.tasks, document.edges)
    }
}
