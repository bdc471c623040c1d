use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Table};
use entwine::{Cardinality, KindDescriptor, Ownership, Schema, engine::scope::is_scoped};
use serde::Serialize;

use crate::context::ProjectContext;
use crate::help::ExampleGroup;
use crate::output::{GlobalOptions, OutputManager, TableDisplay, themed_table};

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Schema Check",
    commands: &[
        "entwine schema check                      # Validate the project's schema file",
        "entwine schema check --schema graph.toml  # Validate a specific schema file",
        "entwine --output json schema check        # Machine-readable kind summary",
    ],
}];

#[derive(Subcommand)]
pub enum SchemaCommands {
    /// Validate the schema and summarize its kinds
    #[command(name = "check")]
    Check {
        /// Schema file (defaults to the one named in entwine.toml)
        #[arg(long)]
        schema: Option<PathBuf>,
    },
}

pub async fn handle_schema_commands(command: SchemaCommands, output: &OutputManager) -> Result<()> {
    match command {
        SchemaCommands::Check { schema } => handle_check(schema, output),
    }
}

fn handle_check(schema_path: Option<PathBuf>, output: &OutputManager) -> Result<()> {
    let schema = match schema_path {
        Some(path) => Schema::from_toml_file(&path)
            .with_context(|| format!("Failed to load schema from {}", path.display()))?,
        None => ProjectContext::find()?.load_schema()?,
    };

    output.heading("Schema Check");
    let report = SchemaReport::from_schema(&schema);
    output.display(&report)?;
    output.success(&format!("{} kinds, all relations resolve", report.kinds.len()));
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct SchemaReport {
    pub kinds: Vec<KindSummary>,
}

#[derive(Debug, Serialize)]
pub struct KindSummary {
    pub name: String,
    pub attributes: usize,
    pub relations: Vec<String>,
    pub scoped: bool,
    pub namespace: bool,
    pub parent: Option<String>,
    pub natural_key: Option<String>,
}

impl SchemaReport {
    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            kinds: schema.kinds().map(|kind| KindSummary::new(schema, kind)).collect(),
        }
    }
}

impl KindSummary {
    fn new(schema: &Schema, kind: &KindDescriptor) -> Self {
        let relations = kind
            .relations
            .iter()
            .map(|relation| {
                let shape = match (relation.ownership, relation.cardinality) {
                    (Ownership::Direct, _) if relation.nullable => "optional",
                    (Ownership::Direct, _) => "required",
                    (Ownership::Reverse, Cardinality::One) => "has one",
                    (Ownership::Reverse, Cardinality::Many) => "has many",
                    (Ownership::ManyToMany, _) => "many to many",
                };
                format!("{} -> {} ({shape})", relation.name, relation.target)
            })
            .collect();
        Self {
            name: kind.name.clone(),
            attributes: kind.attributes.len(),
            relations,
            scoped: is_scoped(schema, &kind.name),
            namespace: kind.namespace,
            parent: kind.parent.clone(),
            natural_key: kind.natural_key.clone(),
        }
    }
}

impl TableDisplay for SchemaReport {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["Kind", "Attributes", "Relations", "Scope", "Natural Key"]);
        for kind in &self.kinds {
            let scope = match (kind.namespace, kind.scoped, &kind.parent) {
                (true, _, _) => "namespace".to_string(),
                (false, true, Some(parent)) => format!("scoped via {parent}"),
                (false, true, None) => "scoped".to_string(),
                (false, false, _) => "global".to_string(),
            };
            table.add_row(vec![
                Cell::new(&kind.name),
                Cell::new(kind.attributes),
                Cell::new(kind.relations.join("\n")),
                Cell::new(scope),
                Cell::new(kind.natural_key.as_deref().unwrap_or("-")),
            ]);
        }
        table
    }

    fn to_compact(&self) -> String {
        self.kinds
            .iter()
            .map(|kind| kind.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}
