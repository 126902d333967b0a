use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::models::EntityConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub sheet_id: String,
    #[serde(default)]
    pub credentials: Option<PathBuf>,
    pub clubs: Vec<EntityConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::parse(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sheet_id.trim().is_empty() {
            bail!("sheet_id must not be empty");
        }
        if self.clubs.is_empty() {
            bail!("at least one [[clubs]] entry is required");
        }

        let mut ids = HashSet::new();
        let mut titles = HashSet::new();
        for club in &self.clubs {
            if club.title.trim().is_empty() {
                bail!("club {} has an empty title", club.id);
            }
            if !ids.insert(club.id.as_str()) {
                bail!("duplicate club id {}", club.id);
            }
            // Titles name the report surfaces, so they must not collide.
            if !titles.insert(club.title.as_str()) {
                bail!("duplicate club title {:?}", club.title);
            }
        }
        Ok(())
    }

    /// All clubs in configured order, or just the one with `id`.
    pub fn select(&self, id: Option<&str>) -> anyhow::Result<Vec<EntityConfig>> {
        match id {
            None => Ok(self.clubs.clone()),
            Some(id) => self
                .clubs
                .iter()
                .find(|club| club.id == id)
                .cloned()
                .map(|club| vec![club])
                .with_context(|| format!("no club with id {id} in config")),
        }
    }
}
