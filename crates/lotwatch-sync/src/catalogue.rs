use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use lotwatch_core::{DEFAULT_PRIORITY, DEFAULT_SITE, KNOWN_SITES};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MakeCatalogue {
    pub makes: Vec<MakeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakeEntry {
    pub make: String,
    #[serde(default = "default_tier")]
    pub tier: u8,
    #[serde(default = "default_sites")]
    pub sites: Vec<i32>,
    /// Fixed model list; empty means the make is expanded through discovery.
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_tier() -> u8 {
    DEFAULT_PRIORITY
}

fn default_sites() -> Vec<i32> {
    vec![DEFAULT_SITE]
}

impl MakeEntry {
    pub fn needs_discovery(&self) -> bool {
        self.models.is_empty()
    }
}

impl MakeCatalogue {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let catalogue: Self = serde_yaml::from_str(text)?;
        catalogue.validate()?;
        Ok(catalogue)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.makes {
            let make = entry.make.trim();
            if make.is_empty() {
                bail!("catalogue entry with blank make");
            }
            if !seen.insert(make.to_ascii_lowercase()) {
                bail!("make {make} listed twice");
            }
            if entry.sites.is_empty() {
                bail!("make {make} has no sites");
            }
            if let Some(site) = entry.sites.iter().find(|s| !KNOWN_SITES.contains(s)) {
                bail!("make {make} lists unknown site {site}");
            }
        }
        Ok(())
    }

    pub fn in_tier(&self, tier: u8) -> impl Iterator<Item = &MakeEntry> {
        self.makes.iter().filter(move |m| m.tier == tier)
    }

    pub fn tiers(&self) -> BTreeSet<u8> {
        self.makes.iter().map(|m| m.tier).collect()
    }
}
