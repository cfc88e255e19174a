//! systemd user units for audio interfaces and shape instances.

use anyhow::{bail, Context, Result};
use systemd_zbus::zbus::Connection;
use systemd_zbus::{ManagerProxy, Mode};
use tokio::runtime::Runtime;

/// Starts and stops named units.
pub trait UnitControl: Send + Sync {
    fn start(&self, unit: &str) -> Result<()>;
    fn stop(&self, unit: &str) -> Result<()>;
}

/// The systemd manager of the user session, reached over D-Bus.
///
/// Jobs are queued with `replace` mode, so a conflicting pending job for the
/// same unit is replaced rather than failing the request.
pub struct SystemdUser {
    runtime: Runtime,
    manager: ManagerProxy<'static>,
}

impl SystemdUser {
    /// Connect to the session bus and the user manager on it.
    pub fn connect() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building D-Bus runtime")?;
        let manager = runtime.block_on(async {
            let connection = Connection::session()
                .await
                .context("connecting to the session bus")?;
            ManagerProxy::new(&connection)
                .await
                .context("reaching the systemd user manager")
        })?;
        Ok(Self { runtime, manager })
    }
}

impl UnitControl for SystemdUser {
    fn start(&self, unit: &str) -> Result<()> {
        validate_unit_name(unit)?;
        tracing::debug!(unit, "queueing start job");
        let job = self
            .runtime
            .block_on(self.manager.start_unit(unit, Mode::Replace))
            .with_context(|| format!("starting unit {unit}"))?;
        tracing::info!(unit, job = %job.as_str(), "started unit");
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<()> {
        validate_unit_name(unit)?;
        tracing::debug!(unit, "queueing stop job");
        let job = self
            .runtime
            .block_on(self.manager.stop_unit(unit, Mode::Replace))
            .with_context(|| format!("stopping unit {unit}"))?;
        tracing::info!(unit, job = %job.as_str(), "stopped unit");
        Ok(())
    }
}

/// Unit names are passed through verbatim; reject the ones systemd never accepts.
fn validate_unit_name(unit: &str) -> Result<()> {
    if unit.is_empty() || unit.starts_with('-') || unit.contains('/') {
        bail!("invalid unit name '{}'", unit);
    }
    if unit.chars().any(|c| c.is_whitespace() || c.is_control()) {
        bail!("invalid unit name '{}'", unit.escape_debug());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records calls instead of touching systemd.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingUnits {
        pub(crate) calls: Mutex<Vec<String>>,
        pub(crate) fail_on: Option<String>,
    }

    impl RecordingUnits {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, verb: &str, unit: &str) -> Result<()> {
            validate_unit_name(unit)?;
            if self.fail_on.as_deref() == Some(unit) {
                bail!("unit {unit} failed");
            }
            self.calls.lock().unwrap().push(format!("{verb} {unit}"));
            Ok(())
        }
    }

    impl UnitControl for RecordingUnits {
        fn start(&self, unit: &str) -> Result<()> {
            self.record("start", unit)
        }

        fn stop(&self, unit: &str) -> Result<()> {
            self.record("stop", unit)
        }
    }

    #[test]
    fn test_unit_names() {
        validate_unit_name("jack@mixpre.service").unwrap();
        validate_unit_name("obake-scsynth.service").unwrap();
        for bad in ["", "--now", "../x.service", "a b.service", "x\n.service"] {
            assert!(validate_unit_name(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_recording_units_fail_on() {
        let units = RecordingUnits {
            fail_on: Some("broken.service".into()),
            ..Default::default()
        };
        units.start("a.service").unwrap();
        assert!(units.start("broken.service").is_err());
        units.stop("a.service").unwrap();
        assert_eq!(units.calls(), vec!["start a.service", "stop a.service"]);
    }
}
