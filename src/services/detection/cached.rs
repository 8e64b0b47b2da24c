use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DetectionFailure, FormDetector};
use crate::models::{CachedSchema, Directory, FormSchema, PageSnapshot, SchemaSource};

/// 目录上缓存的已知表单结构
pub struct CachedSchemaDetector {
    cached: CachedSchema,
}

impl CachedSchemaDetector {
    /// 目录有缓存且未过期时才返回
    pub fn from_directory(
        directory: &Directory,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Option<Self> {
        directory
            .form_schema
            .as_ref()
            .filter(|c| !c.schema.fields.is_empty() && c.is_fresh(now, max_age))
            .map(|c| Self { cached: c.clone() })
    }
}

#[async_trait]
impl FormDetector for CachedSchemaDetector {
    fn name(&self) -> &'static str {
        "cached"
    }

    async fn detect(&self, _snapshot: &PageSnapshot) -> Result<FormSchema, DetectionFailure> {
        let mut schema = self.cached.schema.clone();
        schema.source = SchemaSource::Cached;
        Ok(schema)
    }
}
