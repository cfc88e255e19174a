use std::path::Path;

use anyhow::{bail, Context, Result};
use obake::profile::load_profile;
use obake::setup::{list_setups, resolve_setup, start_setup, stop_setup, SetupConfig};
use obake::units::{SystemdUser, UnitControl};

use super::layout::Layout;

pub(crate) fn interface_list(config: Option<&Path>) -> Result<()> {
    let layout = Layout::load(config)?;
    let default = layout.config.default_audio_interface();
    for name in layout.config.audio_interfaces() {
        let Some(interface) = layout.config.audio_interface(name) else {
            continue;
        };
        println!(
            "{}{:<16} {:<8} {}",
            if name == default { "*" } else { " " },
            name,
            interface.interface_type,
            interface.unit.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub(crate) fn interface_show(config: Option<&Path>, name: &str) -> Result<()> {
    let layout = Layout::load(config)?;
    let interface = layout
        .config
        .audio_interface(name)
        .with_context(|| format!("interface '{}' not found in configuration", name))?;

    println!("name:    {name}");
    println!("type:    {}", interface.interface_type);
    println!("unit:    {}", interface.unit.as_deref().unwrap_or("-"));
    if let Some(path) = &interface.profile {
        let profile = load_profile(path)?;
        println!("profile: {}", path.display());
        println!("  driver:  {}", profile.driver().unwrap_or("-"));
        println!("  device:  {}", profile.device().unwrap_or("-"));
        println!("  options: {}", profile.driver_options().unwrap_or("-"));
    }
    Ok(())
}

pub(crate) fn unit_start(name: &str) -> Result<()> {
    SystemdUser::connect()?.start(name)
}

pub(crate) fn unit_stop(name: &str) -> Result<()> {
    SystemdUser::connect()?.stop(name)
}

pub(crate) fn setup_list(config: Option<&Path>) -> Result<()> {
    let layout = Layout::load(config)?;
    let setups = list_setups(layout.config.setups_dir())?;
    if setups.is_empty() {
        bail!("no setups found in {}", layout.config.setups_dir().display());
    }
    for path in setups {
        let name = path.file_stem().unwrap_or_default().to_string_lossy();
        match SetupConfig::load_from_path(&path) {
            Ok(setup) => println!(
                "{:<16} {:<12} {}",
                name,
                setup.setup.interface,
                setup.managed_shapes().join(", ")
            ),
            Err(err) => println!("{:<16} invalid: {err:#}", name),
        }
    }
    Ok(())
}

fn load_setup(layout: &Layout, setup: &str) -> Result<SetupConfig> {
    let path = resolve_setup(layout.config.setups_dir(), setup)?;
    SetupConfig::load_from_path(&path)
}

pub(crate) fn setup_show(config: Option<&Path>, setup: &str) -> Result<()> {
    let layout = Layout::load(config)?;
    let setup = load_setup(&layout, setup)?;
    println!("interface: {}", setup.setup.interface);
    for name in setup.managed_shapes() {
        let instance = setup.shape(name).cloned().unwrap_or_default();
        println!(
            "shape:     {} (image {}, unit {})",
            name,
            instance.image.as_deref().unwrap_or(name),
            instance.unit.as_deref().unwrap_or("-")
        );
        for (key, value) in instance.env.unwrap_or_default() {
            println!("           {key}={value}");
        }
    }
    Ok(())
}

pub(crate) fn setup_start(config: Option<&Path>, setup: &str) -> Result<()> {
    let layout = Layout::load(config)?;
    let setup_config = load_setup(&layout, setup)?;
    let shapes = start_setup(&layout.config, &setup_config, &SystemdUser::connect()?)?;
    for shape in &shapes {
        let state = if shape.degraded.is_empty() {
            "ok".to_string()
        } else {
            let features: Vec<_> = shape.degraded.iter().map(|w| w.feature.as_str()).collect();
            format!("degraded: {}", features.join(", "))
        };
        println!("[setup:{setup}] {} ({}) {state}", shape.name, shape.image.id);
    }
    Ok(())
}

pub(crate) fn setup_stop(config: Option<&Path>, setup: &str) -> Result<()> {
    let layout = Layout::load(config)?;
    let setup_config = load_setup(&layout, setup)?;
    stop_setup(&layout.config, &setup_config, &SystemdUser::connect()?)?;
    println!("[setup:{setup}] stopped");
    Ok(())
}
