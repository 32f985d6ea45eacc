//! Schema grounding for Text-to-SQL generation.
//!
//! The generator only ever sees the *declared* surface below, never the live
//! catalog: the column metadata is shipped with the deployment so that schema
//! drift cannot silently widen the generated-query surface. A sample provider
//! can enrich the description with one live row per table, best-effort.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// One sampled row, keyed by column name.
pub type SampleRow = serde_json::Map<String, Value>;

/// Best-effort live sample fetch, at most one row per table.
///
/// Implementations must degrade, never fail hard: a missing table or a
/// permission error on one table should not poison the whole snapshot.
#[async_trait]
pub trait SampleProvider: Send + Sync {
    async fn fetch_sample_rows(
        &self,
        table_names: &[String],
    ) -> anyhow::Result<HashMap<String, SampleRow>>;
}

/// Column description shown to the generator.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub col_type: String,
    pub nullable: bool,
    pub sample: Option<String>,
}

/// Table description shown to the generator.
#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub logical_name: String,
    pub physical_name: String,
    pub columns: Vec<ColumnDescriptor>,
}

/// Immutable snapshot of the queryable structure, built fresh per request.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableDescriptor>,
    pub relationships: Vec<String>,
}

/// Tables queryable by default when no allowlist override is configured.
pub const DEFAULT_ALLOWLIST_TABLES: [&str; 8] = [
    "tbl_ProjectInfo",
    "tbl_FormulaComposition",
    "tbl_RawMaterials",
    "tbl_InorganicFillers",
    "tbl_TestResults_Ink",
    "tbl_TestResults_Coating",
    "tbl_TestResults_3DPrint",
    "tbl_TestResults_Composite",
];

const RELATIONSHIP_HINTS: [&str; 7] = [
    "tbl_FormulaComposition.ProjectID_FK -> tbl_ProjectInfo.ProjectID",
    "tbl_FormulaComposition.MaterialID_FK -> tbl_RawMaterials.MaterialID",
    "tbl_FormulaComposition.FillerID_FK -> tbl_InorganicFillers.FillerID",
    "tbl_TestResults_Ink.ProjectID_FK -> tbl_ProjectInfo.ProjectID",
    "tbl_TestResults_Coating.ProjectID_FK -> tbl_ProjectInfo.ProjectID",
    "tbl_TestResults_3DPrint.ProjectID_FK -> tbl_ProjectInfo.ProjectID",
    "tbl_TestResults_Composite.ProjectID_FK -> tbl_ProjectInfo.ProjectID",
];

/// Logical group a physical table belongs to.
fn logical_group(physical_name: &str) -> &'static str {
    match physical_name {
        "tbl_ProjectInfo" => "projects",
        "tbl_RawMaterials" => "materials",
        "tbl_InorganicFillers" => "fillers",
        "tbl_FormulaComposition" => "project_compositions",
        "tbl_TestResults_Ink"
        | "tbl_TestResults_Coating"
        | "tbl_TestResults_3DPrint"
        | "tbl_TestResults_Composite" => "test_results",
        _ => "unknown",
    }
}

/// Declared columns per table: (name, type, nullable).
fn static_columns(physical_name: &str) -> Option<&'static [(&'static str, &'static str, bool)]> {
    match physical_name {
        "tbl_ProjectInfo" => Some(&[
            ("ProjectID", "INTEGER", false),
            ("ProjectName", "VARCHAR", false),
            ("ProjectType_FK", "INTEGER", true),
            ("SubstrateApplication", "TEXT", true),
            ("FormulaCode", "VARCHAR", true),
            ("FormulatorName", "VARCHAR", true),
            ("FormulationDate", "DATE", true),
        ]),
        "tbl_FormulaComposition" => Some(&[
            ("CompositionID", "INTEGER", false),
            ("ProjectID_FK", "INTEGER", false),
            ("MaterialID_FK", "INTEGER", true),
            ("FillerID_FK", "INTEGER", true),
            ("WeightPercentage", "NUMERIC", false),
            ("AdditionMethod", "TEXT", true),
            ("Remarks", "TEXT", true),
        ]),
        "tbl_RawMaterials" => Some(&[
            ("MaterialID", "INTEGER", false),
            ("TradeName", "VARCHAR", false),
            ("Category_FK", "INTEGER", true),
            ("Supplier", "VARCHAR", true),
            ("CAS_Number", "VARCHAR", true),
            ("Density", "NUMERIC", true),
            ("Viscosity", "NUMERIC", true),
            ("FunctionDescription", "TEXT", true),
        ]),
        "tbl_InorganicFillers" => Some(&[
            ("FillerID", "INTEGER", false),
            ("TradeName", "VARCHAR", false),
            ("FillerType_FK", "INTEGER", true),
            ("Supplier", "VARCHAR", true),
            ("ParticleSize", "VARCHAR", true),
            ("IsSilanized", "INTEGER", true),
            ("CouplingAgent", "VARCHAR", true),
            ("SurfaceArea", "NUMERIC", true),
        ]),
        "tbl_TestResults_Ink" => Some(&[
            ("ResultID", "INTEGER", false),
            ("ProjectID_FK", "INTEGER", false),
            ("Ink_Viscosity", "VARCHAR", true),
            ("Ink_Reactivity", "VARCHAR", true),
            ("Ink_ParticleSize", "VARCHAR", true),
            ("Ink_SurfaceTension", "VARCHAR", true),
            ("Ink_ColorValue", "VARCHAR", true),
            ("Ink_RheologyNote", "TEXT", true),
            ("TestDate", "DATE", true),
            ("Notes", "TEXT", true),
        ]),
        "tbl_TestResults_Coating" => Some(&[
            ("ResultID", "INTEGER", false),
            ("ProjectID_FK", "INTEGER", false),
            ("Coating_Adhesion", "VARCHAR", true),
            ("Coating_Transparency", "VARCHAR", true),
            ("Coating_SurfaceHardness", "VARCHAR", true),
            ("Coating_ChemicalResistance", "VARCHAR", true),
            ("Coating_CostEstimate", "VARCHAR", true),
            ("TestDate", "DATE", true),
            ("Notes", "TEXT", true),
        ]),
        "tbl_TestResults_3DPrint" => Some(&[
            ("ResultID", "INTEGER", false),
            ("ProjectID_FK", "INTEGER", false),
            ("Print3D_Shrinkage", "VARCHAR", true),
            ("Print3D_YoungsModulus", "VARCHAR", true),
            ("Print3D_FlexuralStrength", "VARCHAR", true),
            ("Print3D_ShoreHardness", "VARCHAR", true),
            ("Print3D_ImpactResistance", "VARCHAR", true),
            ("TestDate", "DATE", true),
            ("Notes", "TEXT", true),
        ]),
        "tbl_TestResults_Composite" => Some(&[
            ("ResultID", "INTEGER", false),
            ("ProjectID_FK", "INTEGER", false),
            ("Composite_FlexuralStrength", "VARCHAR", true),
            ("Composite_YoungsModulus", "VARCHAR", true),
            ("Composite_ImpactResistance", "VARCHAR", true),
            ("Composite_ConversionRate", "VARCHAR", true),
            ("Composite_WaterAbsorption", "VARCHAR", true),
            ("TestDate", "DATE", true),
            ("Notes", "TEXT", true),
        ]),
        _ => None,
    }
}

/// Stringify a sampled cell, truncated to 60 chars. Empty values drop to None.
fn safe_sample_value(value: Option<&Value>) -> Option<String> {
    let value = value?;
    if value.is_null() {
        return None;
    }
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.chars().count() > 60 {
        let head: String = text.chars().take(57).collect();
        return Some(format!("{head}..."));
    }
    Some(text.to_string())
}

/// Build a grounding snapshot for the selected tables.
///
/// Tables with no declared metadata are dropped with a warning: a missing
/// *description* fails open, while a missing *policy membership* (the guard's
/// allowlist) fails closed. The two must not be confused.
pub async fn build_snapshot(
    sample_provider: Option<&dyn SampleProvider>,
    table_names: &[String],
) -> SchemaSnapshot {
    let selected: Vec<String> = table_names
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    let mut sample_rows: HashMap<String, SampleRow> = HashMap::new();
    if let Some(provider) = sample_provider {
        if !selected.is_empty() {
            match provider.fetch_sample_rows(&selected).await {
                Ok(rows) => sample_rows = rows,
                Err(error) => {
                    warn!(%error, "failed to load schema grounding sample rows");
                }
            }
        }
    }

    let mut tables = Vec::new();
    for table_name in &selected {
        let Some(hints) = static_columns(table_name) else {
            warn!(table = %table_name, "schema grounding table hints not found");
            continue;
        };

        let row_sample = sample_rows.get(table_name);
        let columns = hints
            .iter()
            .map(|(name, col_type, nullable)| ColumnDescriptor {
                name: (*name).to_string(),
                col_type: (*col_type).to_string(),
                nullable: *nullable,
                sample: safe_sample_value(row_sample.and_then(|row| row.get(*name))),
            })
            .collect();

        tables.push(TableDescriptor {
            logical_name: logical_group(table_name).to_string(),
            physical_name: table_name.clone(),
            columns,
        });
    }

    let available: Vec<&str> = tables
        .iter()
        .map(|table| table.physical_name.as_str())
        .collect();
    let relationships = RELATIONSHIP_HINTS
        .iter()
        .filter(|hint| {
            relationship_endpoints(hint)
                .map(|(child, parent)| {
                    available.contains(&child) && available.contains(&parent)
                })
                .unwrap_or(false)
        })
        .map(|hint| (*hint).to_string())
        .collect();

    SchemaSnapshot {
        tables,
        relationships,
    }
}

fn relationship_endpoints(hint: &str) -> Option<(&str, &str)> {
    let (child, parent) = hint.split_once(" -> ")?;
    let child_table = child.split('.').next()?;
    let parent_table = parent.split('.').next()?;
    Some((child_table, parent_table))
}

/// Render a snapshot as plain indented text for the generator's prompt.
pub fn render_snapshot(snapshot: &SchemaSnapshot) -> String {
    let mut table_lines = Vec::new();
    for table in &snapshot.tables {
        table_lines.push(format!(
            "- [{}] {}",
            table.logical_name, table.physical_name
        ));
        for column in &table.columns {
            let nullable_suffix = if column.nullable { "nullable" } else { "not-null" };
            let sample_suffix = column
                .sample
                .as_ref()
                .map(|sample| format!(", sample={sample}"))
                .unwrap_or_default();
            table_lines.push(format!(
                "  - {} ({}, {}{})",
                column.name, column.col_type, nullable_suffix, sample_suffix
            ));
        }
    }

    let mut relation_lines: Vec<String> = snapshot
        .relationships
        .iter()
        .map(|hint| format!("- {hint}"))
        .collect();

    if table_lines.is_empty() {
        table_lines.push("- (no table metadata available)".to_string());
    }
    if relation_lines.is_empty() {
        relation_lines.push("- (no relationship metadata available)".to_string());
    }

    format!(
        "Tables:\n{}\n\nRelationships:\n{}",
        table_lines.join("\n"),
        relation_lines.join("\n")
    )
}
