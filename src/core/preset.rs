//! Deployment presets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Deployment profile selected for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Physical lab: real switches and servers.
    Lab,
    /// Virtual lab: switches and servers are simulated VMs.
    Vlab,
}

impl Preset {
    pub const ALL: [Preset; 2] = [Preset::Lab, Preset::Vlab];

    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Lab => "lab",
            Preset::Vlab => "vlab",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lab" => Ok(Preset::Lab),
            "vlab" => Ok(Preset::Vlab),
            _ => Err(format!(
                "invalid preset '{}'; expected one of: {}",
                s,
                Preset::ALL.map(Preset::as_str).join(", ")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_round_trip() {
        for preset in Preset::ALL {
            assert_eq!(preset.to_string().parse::<Preset>().unwrap(), preset);
        }
        assert_eq!("VLAB".parse::<Preset>().unwrap(), Preset::Vlab);
    }

    #[test]
    fn test_preset_parse_error_lists_choices() {
        let err = "cloud".parse::<Preset>().unwrap_err();
        assert!(err.contains("lab, vlab"));
    }
}
