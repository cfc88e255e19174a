//! Audio interface driver profiles.
//!
//! A profile is flat `KEY=value` text read by the audio backend at daemon
//! start. This crate never writes one; it parses them only to show what an
//! interface will be started with.
//!
//! ```text
//! # MixPre-6 over USB
//! DRIVER=alsa
//! DEVICE=hw:MixPre6
//! DRIVER_OPTS="-r 48000 -p 256 -n 2"
//! ```

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Key naming the backend driver.
pub const DRIVER_KEY: &str = "DRIVER";
/// Key naming the device.
pub const DEVICE_KEY: &str = "DEVICE";
/// Key holding the driver-specific option string.
pub const DRIVER_OPTS_KEY: &str = "DRIVER_OPTS";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub entries: BTreeMap<String, String>,
}

impl Profile {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn driver(&self) -> Option<&str> {
        self.get(DRIVER_KEY)
    }

    pub fn device(&self) -> Option<&str> {
        self.get(DEVICE_KEY)
    }

    pub fn driver_options(&self) -> Option<&str> {
        self.get(DRIVER_OPTS_KEY)
    }
}

pub fn load_profile(path: &Path) -> Result<Profile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading profile {}", path.display()))?;
    parse_profile(&raw).with_context(|| format!("parsing profile {}", path.display()))
}

pub fn parse_profile(raw: &str) -> Result<Profile> {
    let mut profile = Profile::default();
    for (n, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            bail!("line {}: expected KEY=value, got '{}'", n + 1, line);
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("line {}: invalid key '{}'", n + 1, key);
        }
        let value = unquote(value.trim()).with_context(|| format!("line {}", n + 1))?;
        profile.entries.insert(key.to_string(), value);
    }
    Ok(profile)
}

fn unquote(value: &str) -> Result<String> {
    for quote in ['"', '\''] {
        if let Some(rest) = value.strip_prefix(quote) {
            let Some(inner) = rest.strip_suffix(quote) else {
                bail!("unterminated {} quote", quote);
            };
            return Ok(inner.to_string());
        }
    }
    // Unquoted values end at an inline comment.
    let value = match value.find(" #") {
        Some(i) => &value[..i],
        None => value,
    };
    Ok(value.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profile() {
        let profile = parse_profile(
            "# MixPre-6\n\nDRIVER=alsa\nexport DEVICE = hw:MixPre6 # usb\nDRIVER_OPTS=\"-r 48000 -p 256\"\nNAME='a # b'\n",
        )
        .unwrap();
        assert_eq!(profile.driver(), Some("alsa"));
        assert_eq!(profile.device(), Some("hw:MixPre6"));
        assert_eq!(profile.driver_options(), Some("-r 48000 -p 256"));
        assert_eq!(profile.get("NAME"), Some("a # b"));
        assert_eq!(profile.entries.len(), 4);
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert!(parse_profile("DRIVER alsa\n").is_err());
        assert!(parse_profile("BAD-KEY=1\n").is_err());
        assert!(parse_profile("OPTS=\"open\n").is_err());
    }

    #[test]
    fn test_load_profile() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("mixpre.conf");
        std::fs::write(&path, "DRIVER=jack\n").unwrap();
        assert_eq!(load_profile(&path).unwrap().driver(), Some("jack"));
        assert!(load_profile(&temp.path().join("missing")).is_err());
    }
}
