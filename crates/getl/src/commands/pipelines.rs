//! `getl pipelines` - list pipeline groups, dataset types and template directories

use clap::Args;

use crate::error::CliError;
use getl_core::catalog::DatasetCatalog;
use getl_core::settings::Settings;
use getl_core::templates::{TemplateCatalog, pipeline_name_from_dir};

/// Arguments for the `pipelines` command
#[derive(Args, Debug, Default)]
pub struct PipelinesArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Handle the `pipelines` command
pub fn handle_pipelines(args: &PipelinesArgs, settings: &Settings) -> Result<(), CliError> {
    let catalog = DatasetCatalog::load(&settings.datasets_file)?;
    let templates = TemplateCatalog::new(&settings.migrations_dir);
    let template_dirs = templates.list_pipeline_dirs()?;

    if args.json {
        let value = serde_json::json!({
            "pipelines": catalog.pipelines(),
            "types": catalog.types().into_iter().map(|(typ, count)| {
                serde_json::json!({ "type": typ, "datasets": count })
            }).collect::<Vec<_>>(),
            "template_dirs": template_dirs,
        });
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| CliError::InvalidArgument(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    println!("Pipelines ({} datasets)", catalog.len());
    if catalog.pipelines().is_empty() {
        println!("  (ungrouped)");
    }
    for pipeline in catalog.pipelines() {
        let has_templates = template_dirs
            .iter()
            .any(|dir| pipeline_name_from_dir(dir) == pipeline.id);
        println!(
            "  {:<20} {:>3}/{:<3} enabled  {}{}",
            pipeline.id,
            pipeline.enabled_count,
            pipeline.dataset_count,
            pipeline.name,
            if has_templates { "" } else { "  (shared templates only)" }
        );
    }

    let types = catalog.types();
    if !types.is_empty() {
        println!();
        println!("Types:");
        for (typ, count) in types {
            println!("  {typ:<20} {count}");
        }
    }
    Ok(())
}
