//! Build minimal runtime images for audio daemons, launch them, and bootstrap
//! the siren live-coding shell.
//!
//! A *shape* wraps one third-party daemon. Its recipe (`shapes/<name>/shape.toml`)
//! pins the upstream source, lists the build dependencies and the ordered
//! build steps, allow-lists the artifacts that may ship, and names the
//! runtime packages, fixups, device bindings and entrypoint binary.
//!
//! # Architecture
//!
//! ```text
//! recipe ──► fetch ──► build (disposable environment, full tooling)
//!                         │
//!                         ▼
//!              select (allow-list) ──► assemble (runtime packages, fixups)
//!                                          │
//!                                          ▼
//!                         images/<name>-<version>/rootfs  + manifest + archive
//!                                          │
//!                                          ▼
//!                                 entrypoint ──► daemon <args...>
//! ```
//!
//! - **Pipeline** - [`pipeline::Pipeline`] runs fetch, build, select and assemble
//!   for one shape, or several in parallel
//! - **Images** - [`assemble::RuntimeImage`] and [`store::ImageStore`] own
//!   published images and their archives
//! - **Entrypoint** - [`entrypoint::Dispatcher`] is the one fixed command an
//!   instance runs
//! - **Host** - [`config`], [`setup`], [`profile`] and [`units`] drive audio
//!   interfaces and shape instances on the host
//! - **siren** - [`siren`] is the control-plane bootstrap of the live-coding shell
//!
//! # Example
//!
//! ```rust,ignore
//! use obake::packages::PackagePool;
//! use obake::pipeline::Pipeline;
//! use obake::recipe::find_recipe;
//! use std::sync::Arc;
//!
//! let recipe = find_recipe("shapes".as_ref(), "serialosc")?;
//! let pipeline = Pipeline::new("work", "images", Arc::new(PackagePool::new("packages")));
//! let image = pipeline.build(&recipe)?;
//! println!("{}", image.image().rootfs().display());
//! ```

pub mod assemble;
pub mod build;
pub mod config;
pub mod entrypoint;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod manifest;
pub mod packages;
pub mod pipeline;
pub mod preflight;
pub mod profile;
pub mod recipe;
pub mod select;
pub mod setup;
pub mod siren;
pub mod store;
pub mod units;

pub use error::{DegradedModeWarning, PipelineError};
pub use recipe::ShapeRecipe;

/// Build version from git (nearest tag or short commit, `-dirty` when modified).
pub mod version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}
pub use version::VERSION;
