// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;
use crate::session::types::ServerId;

pub const DEFAULT_CATEGORIES: [&str; 7] = ["work", "break", "meeting", "development", "support", "training", "admin"];
pub const RESERVED_NAMES: [&str; 6] = ["all", "total", "admin", "system", "config", "settings"];

const MAX_NAME_LEN: usize = 50;
const MAX_DESCRIPTION_LEN: usize = 200;
const MAX_WEIGHT: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    /// `#rrggbb`
    pub color: String,
    pub description: String,
    pub productivity_weight: f64,
    #[serde(default)]
    pub archived: bool,
}

impl Category {
    fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            color: derive_color(name),
            description: default_description(name),
            productivity_weight: 1.0,
            archived: false,
        }
    }
}

/// Every category a server has defined, archived ones included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub server_id: ServerId,
    pub categories: Vec<Category>,
}

impl CategoryConfig {
    /// The set an unconfigured server starts with.
    pub fn defaults(server_id: ServerId) -> Self {
        Self {
            server_id,
            categories: DEFAULT_CATEGORIES.iter().map(|name| Category::builtin(name)).collect(),
        }
    }

    pub fn find(&self, name: &str) -> Option<&Category> {
        let name = normalize(name);
        self.categories.iter().find(|c| c.name == name)
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut Category> {
        let name = normalize(name);
        self.categories.iter_mut().find(|c| c.name == name)
    }

    pub fn active(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter().filter(|c| !c.archived)
    }

    /// The named category if it can take new sessions.
    pub fn require_active(&self, name: &str) -> Result<&Category, ValidationError> {
        match self.find(name) {
            Some(category) if !category.archived => Ok(category),
            found => Err(ValidationError::UnknownCategory {
                server_id: self.server_id,
                category: normalize(name),
                archived: found.is_some(),
            }),
        }
    }
}

/// A category as requested by an administrator.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewCategory {
    pub name: String,
    pub color: Option<String>,
    pub description: Option<String>,
    pub productivity_weight: Option<f64>,
}

impl NewCategory {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Check every field and produce the stored form.
    pub fn validate(self) -> Result<Category, ValidationError> {
        let trimmed = self.name.trim();
        if trimmed.is_empty()
            || trimmed.chars().count() > MAX_NAME_LEN
            || !trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidName(self.name));
        }
        let name = normalize(trimmed);
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(ValidationError::ReservedName(name));
        }

        if let Some(description) = &self.description {
            let len = description.chars().count();
            if len > MAX_DESCRIPTION_LEN {
                return Err(ValidationError::DescriptionTooLong {
                    len,
                    max: MAX_DESCRIPTION_LEN,
                });
            }
        }

        if let Some(color) = &self.color {
            if !is_hex_color(color) {
                return Err(ValidationError::InvalidColor(color.clone()));
            }
        }

        let weight = self.productivity_weight.unwrap_or(1.0);
        if !(0.0..=MAX_WEIGHT).contains(&weight) {
            return Err(ValidationError::WeightOutOfRange(weight));
        }

        Ok(Category {
            color: self
                .color
                .map(|c| c.to_ascii_lowercase())
                .unwrap_or_else(|| derive_color(&name)),
            description: self.description.unwrap_or_else(|| default_description(&name)),
            productivity_weight: weight,
            archived: false,
            name,
        })
    }
}

pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

fn default_description(name: &str) -> String {
    format!("Time tracking for {}", name)
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7 && color.starts_with('#') && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Stable colour from the name's SHA-256, lifted when too dark to read.
pub fn derive_color(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut rgb = [digest[0], digest[1], digest[2]];
    let brightness = rgb.iter().map(|&c| u32::from(c)).sum::<u32>() / 3;
    if brightness < 128 {
        for c in &mut rgb {
            *c = c.saturating_add(64);
        }
    }
    format!("#{}", hex::encode(rgb))
}
