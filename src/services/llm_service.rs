//! 表单识别用的 LLM 客户端
//!
//! 通过 `async-openai` 调用兼容 OpenAI 的 Chat API（OpenAI / Azure / Gemini / Groq 等），
//! 页面截图以 data URL 的形式随提示词一起发送。返回原始文本，解析交给调用方。

use anyhow::{anyhow, Result};
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use tracing::{debug, warn};

use crate::config::Config;

/// 识别结果需要稳定，温度压低
const TEMPERATURE: f32 = 0.1;
const MAX_TOKENS: u32 = 4096;

/// 一次识别请求
#[derive(Debug, Clone, Copy)]
pub struct ChatPrompt<'a> {
    pub system: &'a str,
    pub text: &'a str,
    /// PNG 截图的 base64（不含 data URL 前缀）
    pub screenshot_base64: Option<&'a str>,
}

pub struct LlmService {
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl LlmService {
    /// 未配置 `LLM_API_KEY` 时返回 `None`，识别网关随之退回规则识别
    pub fn new(config: &Config) -> Option<Self> {
        let api_key = config.llm_api_key.as_deref()?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&config.llm_api_base_url);

        Some(Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// 发送提示词（可附带截图），返回模型回复的文本
    pub async fn chat(&self, prompt: ChatPrompt<'_>) -> Result<String> {
        debug!(
            "调用 LLM，模型: {}，提示词 {} 字符，截图: {}",
            self.model_name,
            prompt.text.len(),
            prompt.screenshot_base64.is_some()
        );

        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(prompt.system)
            .build()?;
        let messages = vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user_message(prompt.text, prompt.screenshot_base64)?),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(TEMPERATURE)
            .max_tokens(MAX_TOKENS)
            .build()?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM 调用失败: {}", e);
            anyhow!("LLM 调用失败: {}", e)
        })?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| anyhow!("LLM 返回内容为空"))
    }
}

/// 有截图时先放图片再放文字，没有截图就是纯文本消息
fn user_message(text: &str, screenshot_base64: Option<&str>) -> Result<ChatCompletionRequestUserMessage> {
    let Some(b64) = screenshot_base64 else {
        return Ok(ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()?);
    };

    let parts = vec![
        ChatCompletionRequestUserMessageContentPart::ImageUrl(
            ChatCompletionRequestMessageContentPartImage {
                image_url: ImageUrl {
                    url: screenshot_data_url(b64),
                    detail: Some(ImageDetail::High),
                },
            },
        ),
        ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartText {
                text: text.to_string(),
            },
        ),
    ];

    Ok(ChatCompletionRequestUserMessageArgs::default()
        .content(ChatCompletionRequestUserMessageContent::Array(parts))
        .build()?)
}

fn screenshot_data_url(b64: &str) -> String {
    format!("data:image/png;base64,{}", b64)
}
