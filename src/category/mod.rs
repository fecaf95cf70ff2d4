// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-server category configuration.
//!
//! One record per server, read through the cache hierarchy. Servers that
//! never configured anything see the default set without it being written.
//! All validation happens on the write path.
//!
//! Removing a category deletes it only while no time has been recorded
//! against it in the server totals. Otherwise it is archived, so history
//! keeps resolving.

pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use serde::Serialize;
use tracing::info;

pub use types::{Category, CategoryConfig, NewCategory, DEFAULT_CATEGORIES, RESERVED_NAMES};

use crate::batching::Priority;
use crate::cache::{CacheHierarchy, WriteOptions};
use crate::config::TimecardConfig;
use crate::error::{Result, ValidationError};
use crate::metrics::LatencyTimer;
use crate::session::keys;
use crate::session::types::{ServerId, ServerTotals};

const ORIGIN: &str = "category";

pub fn key(server_id: ServerId) -> String {
    format!("categories:{}", server_id)
}

/// What `remove_category` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "category", rename_all = "snake_case")]
pub enum CategoryRemoval {
    Deleted(Category),
    /// Recorded time exists, so the category was archived instead
    Archived(Category),
}

impl CategoryRemoval {
    pub fn category(&self) -> &Category {
        match self {
            Self::Deleted(c) | Self::Archived(c) => c,
        }
    }
}

pub struct CategoryRegistry {
    cache: Arc<CacheHierarchy>,
    max_categories: usize,
    ttl: Duration,
    /// Category edits are rare admin actions; one writer at a time is enough
    write_lock: Mutex<()>,
}

impl CategoryRegistry {
    pub fn new(cache: Arc<CacheHierarchy>, config: &TimecardConfig) -> Self {
        Self {
            cache,
            max_categories: config.max_categories,
            ttl: config.category_ttl(),
            write_lock: Mutex::new(()),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_category_config(&self, server_id: ServerId) -> Result<CategoryConfig> {
        let _timer = LatencyTimer::new("get_category_config");
        let config = self.cache.get_json::<CategoryConfig>(&key(server_id)).await?;
        Ok(config.unwrap_or_else(|| CategoryConfig::defaults(server_id)))
    }

    /// The named category if sessions may start against it.
    pub async fn require_active(&self, server_id: ServerId, name: &str) -> Result<Category> {
        let config = self.get_category_config(server_id).await?;
        Ok(config.require_active(name)?.clone())
    }

    #[tracing::instrument(skip(self, category), fields(name = %category.name))]
    pub async fn add_category(&self, server_id: ServerId, category: NewCategory) -> Result<Category> {
        let _timer = LatencyTimer::new("add_category");
        let category = category.validate()?;
        let _guard = self.write_lock.lock().await;

        let mut config = self.get_category_config(server_id).await?;
        if config.find(&category.name).is_some() {
            return Err(ValidationError::DuplicateCategory(category.name).into());
        }
        if config.categories.len() >= self.max_categories {
            return Err(ValidationError::TooManyCategories {
                max: self.max_categories,
            }
            .into());
        }

        config.categories.push(category.clone());
        self.save(&config)?;
        info!(server_id, name = %category.name, "Category added");
        Ok(category)
    }

    /// Names sorted alphabetically; archived ones only when asked for.
    #[tracing::instrument(skip(self))]
    pub async fn list_categories(&self, server_id: ServerId, include_archived: bool) -> Result<Vec<Category>> {
        let _timer = LatencyTimer::new("list_categories");
        let config = self.get_category_config(server_id).await?;
        let mut categories: Vec<Category> = config
            .categories
            .into_iter()
            .filter(|c| include_archived || !c.archived)
            .collect();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(categories)
    }

    /// Delete an unused category, or archive it if time was recorded against it.
    #[tracing::instrument(skip(self))]
    pub async fn remove_category(&self, server_id: ServerId, name: &str) -> Result<CategoryRemoval> {
        let _timer = LatencyTimer::new("remove_category");
        let _guard = self.write_lock.lock().await;
        let mut config = self.get_category_config(server_id).await?;
        let normalized = types::normalize(name);
        let Some(index) = config.categories.iter().position(|c| c.name == normalized) else {
            return Err(unknown(server_id, name));
        };

        let usage = self
            .cache
            .get_json::<ServerTotals>(&keys::server_totals(server_id))
            .await?
            .unwrap_or_else(|| ServerTotals::new(server_id));

        let removal = if usage.has_usage(&normalized) {
            let category = &mut config.categories[index];
            category.archived = true;
            CategoryRemoval::Archived(category.clone())
        } else {
            CategoryRemoval::Deleted(config.categories.remove(index))
        };

        self.save(&config)?;
        info!(server_id, name = %normalized, removal = ?removal, "Category removed");
        Ok(removal)
    }

    /// Stop new sessions against a category. Open sessions are unaffected.
    #[tracing::instrument(skip(self))]
    pub async fn archive_category(&self, server_id: ServerId, name: &str) -> Result<Category> {
        self.set_archived(server_id, name, true).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn restore_category(&self, server_id: ServerId, name: &str) -> Result<Category> {
        self.set_archived(server_id, name, false).await
    }

    async fn set_archived(&self, server_id: ServerId, name: &str, archived: bool) -> Result<Category> {
        let _timer = LatencyTimer::new(if archived { "archive_category" } else { "restore_category" });
        let _guard = self.write_lock.lock().await;
        let mut config = self.get_category_config(server_id).await?;
        let Some(category) = config.find_mut(name) else {
            return Err(unknown(server_id, name));
        };
        if category.archived == archived {
            return Ok(category.clone());
        }
        category.archived = archived;
        let updated = category.clone();

        self.save(&config)?;
        info!(server_id, name = %updated.name, archived, "Category archive state changed");
        Ok(updated)
    }

    fn save(&self, config: &CategoryConfig) -> Result<()> {
        let options = WriteOptions::warm(Priority::Normal, ORIGIN).with_ttl(self.ttl);
        self.cache.put_json(&key(config.server_id), config, options)?;
        Ok(())
    }
}

fn unknown(server_id: ServerId, name: &str) -> crate::error::EngineError {
    ValidationError::UnknownCategory {
        server_id,
        category: types::normalize(name),
        archived: false,
    }
    .into()
}
