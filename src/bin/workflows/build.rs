use std::path::Path;

use anyhow::{bail, Result};
use obake::assemble::AssembleOutcome;
use obake::build::plan;
use obake::recipe::{discover_recipes, find_recipe, ShapeRecipe};

use super::layout::Layout;

pub(crate) fn shape_list(config: Option<&Path>) -> Result<()> {
    let layout = Layout::load(config)?;
    let recipes = discover_recipes(&layout.shapes_dir)?;
    if recipes.is_empty() {
        bail!("no shapes found under {}", layout.shapes_dir.display());
    }
    for recipe in recipes {
        let built = layout.images_dir.join(recipe.image_id()).is_dir();
        println!(
            "{:<20} {:<12} {}",
            recipe.name,
            recipe.version,
            if built { "built" } else { "-" }
        );
    }
    Ok(())
}

pub(crate) fn shape_show(config: Option<&Path>, name: &str) -> Result<()> {
    let layout = Layout::load(config)?;
    let recipe = find_recipe(&layout.shapes_dir, name)?;
    println!("{}", describe(&recipe));
    Ok(())
}

fn describe(recipe: &ShapeRecipe) -> String {
    let mut out = String::new();
    out.push_str(&format!("name:        {}\n", recipe.name));
    out.push_str(&format!("version:     {}\n", recipe.version));
    out.push_str(&format!(
        "source:      {} ({})\n",
        recipe.source.url(),
        recipe.source.pin()
    ));
    out.push_str(&format!(
        "build deps:  {}\n",
        recipe.build.dependencies.join(", ")
    ));
    out.push_str(&format!("steps:       {}\n", recipe.build.steps.len()));
    out.push_str(&format!("allow:       {}\n", recipe.artifacts.allow.join(", ")));
    out.push_str(&format!(
        "runtime deps: {}\n",
        recipe.runtime.dependencies.join(", ")
    ));
    for binding in &recipe.runtime.bindings {
        out.push_str(&format!(
            "binding:     {} -> {} ({})\n",
            binding.host.display(),
            binding.target.display(),
            binding.feature
        ));
    }
    out.push_str(&format!("entrypoint:  {}", recipe.entrypoint.command));
    out
}

pub(crate) fn shape_plan(config: Option<&Path>, name: &str) -> Result<()> {
    let layout = Layout::load(config)?;
    let recipe = find_recipe(&layout.shapes_dir, name)?;
    print!("{}", plan(&recipe));
    Ok(())
}

pub(crate) fn shape_build(
    config: Option<&Path>,
    names: &[String],
    all: bool,
    jobs: usize,
) -> Result<()> {
    let layout = Layout::load(config)?;
    let recipes = if all {
        discover_recipes(&layout.shapes_dir)?
    } else if names.is_empty() {
        bail!("name at least one shape, or pass --all");
    } else {
        names
            .iter()
            .map(|name| find_recipe(&layout.shapes_dir, name))
            .collect::<Result<Vec<_>>>()?
    };

    let pipeline = layout.pipeline()?;
    let mut failed = Vec::new();
    for (name, result) in pipeline.build_many(&recipes, jobs) {
        match result {
            Ok(AssembleOutcome::Published(image)) => {
                println!("[shape:{name}] published {}", image.dir.display());
            }
            Ok(AssembleOutcome::AlreadyBuilt(image)) => {
                println!("[shape:{name}] already built: {}", image.dir.display());
            }
            Err(err) => {
                eprintln!("[shape:{name}] failed: {err:#}");
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        bail!("{} of {} shape(s) failed: {}", failed.len(), recipes.len(), failed.join(", "));
    }
    Ok(())
}
