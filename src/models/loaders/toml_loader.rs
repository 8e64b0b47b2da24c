use std::path::Path;

use serde::Deserialize;
use tokio::fs;

use crate::error::{AppError, AppResult, FileError};
use crate::models::directory::{Directory, DirectoryId};
use crate::models::product::{Product, ProductId};
use crate::models::submission::SubmissionId;

/// 种子文件的内容：产品、目录以及要执行的投递组合
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub directories: Vec<Directory>,
    #[serde(default)]
    pub submissions: Vec<SubmissionSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionSeed {
    pub id: SubmissionId,
    pub product_id: ProductId,
    pub directory_id: DirectoryId,
    /// 为空时使用配置中的默认值
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// 解析种子 TOML 文本，并检查投递引用的产品 / 目录都存在
pub fn parse_seed(content: &str, origin: &str) -> AppResult<SeedData> {
    let seed: SeedData = toml::from_str(content).map_err(|e| {
        AppError::File(FileError::TomlParseFailed {
            path: origin.to_string(),
            source: Box::new(e),
        })
    })?;

    for s in &seed.submissions {
        if !seed.products.iter().any(|p| p.id == s.product_id) {
            return Err(AppError::Other(format!(
                "投递 #{} 引用了不存在的产品 #{}",
                s.id, s.product_id
            )));
        }
        if !seed.directories.iter().any(|d| d.id == s.directory_id) {
            return Err(AppError::Other(format!(
                "投递 #{} 引用了不存在的目录 #{}",
                s.id, s.directory_id
            )));
        }
    }

    Ok(seed)
}

/// 从 TOML 文件加载种子数据
pub async fn load_seed_file(path: &Path) -> AppResult<SeedData> {
    let shown = path.display().to_string();
    if !path.exists() {
        return Err(AppError::File(FileError::NotFound { path: shown }));
    }

    let content = fs::read_to_string(path)
        .await
        .map_err(|e| AppError::file_read_failed(&shown, e))?;

    let seed = parse_seed(&content, &shown)?;
    tracing::info!(
        "成功加载种子文件 {}: {} 个产品, {} 个目录, {} 个投递",
        shown,
        seed.products.len(),
        seed.directories.len(),
        seed.submissions.len()
    );
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"
[[products]]
id = 1
name = "Acme Analytics"
website_url = "https://acme.example"
tagline = "Metrics without the mess"
contact_email = "founder@acme.example"
tags = ["analytics", "saas"]

[[directories]]
id = 10
name = "Tool Hunt"
url = "https://toolhunt.example"
submission_url = "https://toolhunt.example/submit"

[[submissions]]
id = 100
product_id = 1
directory_id = 10
max_attempts = 5
"#;

    #[test]
    fn parses_seed_with_defaults() {
        let seed = parse_seed(SEED, "inline").unwrap();
        assert_eq!(seed.products[0].tags, vec!["analytics", "saas"]);
        assert!(seed.directories[0].requires_approval);
        assert!(seed.directories[0].form_schema.is_none());
        assert_eq!(seed.submissions[0].max_attempts, Some(5));
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let broken = SEED.replace("directory_id = 10", "directory_id = 11");
        assert!(parse_seed(&broken, "inline").is_err());
    }

    #[tokio::test]
    async fn missing_file_reports_not_found() {
        let err = load_seed_file(Path::new("/definitely/not/here.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::File(FileError::NotFound { .. })));
    }

    #[tokio::test]
    async fn loads_seed_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.toml");
        tokio::fs::write(&path, SEED).await.unwrap();
        let seed = load_seed_file(&path).await.unwrap();
        assert_eq!(seed.submissions.len(), 1);
    }
}
