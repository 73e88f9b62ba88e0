//! Category reference data
//!
//! Categories are not encrypted. They are looked up to denormalize
//! `category: {name, color}` onto provisional records.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Color used when a category has none
pub const DEFAULT_CATEGORY_COLOR: &str = "#6B7280";

/// A spending/income category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl Category {
    /// Create a new category
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: None,
        }
    }

    /// Set the display color
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// The `{name, color}` object embedded in joined rows
    pub fn summary(&self) -> Value {
        json!({
            "name": self.name,
            "color": self.color.as_deref().unwrap_or(DEFAULT_CATEGORY_COLOR),
        })
    }
}

/// Best-effort lookup of the embedded summary for `category_id`
pub fn category_summary(categories: &[Category], category_id: Option<&str>) -> Value {
    category_id
        .and_then(|id| categories.iter().find(|c| c.id == id))
        .map(Category::summary)
        .unwrap_or(Value::Null)
}
