use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::Cacheable;

/// A reusable clause as served by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default, alias = "clientId")]
  pub client_id: Option<String>,
  #[serde(default, alias = "updatedAt")]
  pub updated_at: Option<DateTime<Utc>>,
  /// Fields this client does not interpret, kept so nothing is lost on a
  /// round trip through the cache
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Cacheable for Clause {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    self.updated_at
  }

  fn entity_type() -> &'static str {
    "clause"
  }
}

/// Fields of a clause that does not exist yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClauseDraft {
  pub title: String,
  pub body: String,
  pub category: Option<String>,
  pub tags: Vec<String>,
  pub client_id: Option<String>,
}

impl ClauseDraft {
  pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      body: body.into(),
      ..Self::default()
    }
  }

  /// Materialize the draft under a locally generated id.
  pub fn into_clause(self, id: String, now: DateTime<Utc>) -> Clause {
    Clause {
      id,
      title: self.title,
      body: self.body,
      category: self.category,
      tags: self.tags,
      client_id: self.client_id,
      updated_at: Some(now),
      extra: Map::new(),
    }
  }
}
