//! JS 执行器 - 基础设施层
//!
//! 持有一个会话的 page，只暴露"执行 JS"的能力

use anyhow::Result;
use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// JS 执行器
///
/// 职责：
/// - 持有会话的 Page
/// - 暴露 eval() / invoke() 能力
/// - 不认识投递 / 目录
pub struct JsExecutor {
    page: Page,
}

impl JsExecutor {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// 获取 page 的引用（用于导航、截图等非脚本操作）
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// 执行 JS 代码并返回 JSON 结果
    pub async fn eval(&self, js_code: impl Into<String>) -> Result<JsonValue> {
        let result = self.page.evaluate(js_code.into()).await?;
        let json_value = result.into_value()?;
        Ok(json_value)
    }

    /// 执行 JS 代码并反序列化为指定类型
    pub async fn eval_as<T: DeserializeOwned>(&self, js_code: impl Into<String>) -> Result<T> {
        let json_value = self.eval(js_code).await?;
        let typed_value = serde_json::from_value(json_value)?;
        Ok(typed_value)
    }

    /// 以 JSON 参数调用一个 JS 函数表达式
    ///
    /// 参数经过 JSON 序列化后拼接，选择器和填写值里的引号不会破坏脚本。
    pub async fn invoke<T: DeserializeOwned>(&self, function: &str, args: &[JsonValue]) -> Result<T> {
        self.eval_as(build_invocation(function, args)?).await
    }
}

fn build_invocation(function: &str, args: &[JsonValue]) -> Result<String> {
    let args = args
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})({})", function.trim(), args.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_quotes_arguments() {
        let js = build_invocation(
            "(sel, v) => document.querySelector(sel).value = v",
            &[json!("input[name='q']"), json!("say \"hi\"")],
        )
        .unwrap();
        assert_eq!(
            js,
            r#"((sel, v) => document.querySelector(sel).value = v)("input[name='q']", "say \"hi\"")"#
        );
    }
}
