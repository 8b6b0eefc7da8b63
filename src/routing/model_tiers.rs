use serde::{Deserialize, Serialize};

use crate::providers::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Premium,
    Standard,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPricing {
    pub model: &'static str,
    pub provider: ProviderId,
    pub tier: ModelTier,
    /// 美元 / 1K tokens
    pub input_price_per_k: f64,
    pub output_price_per_k: f64,
}

const fn entry(
    model: &'static str,
    provider: ProviderId,
    input: f64,
    output: f64,
    tier: ModelTier,
) -> ModelPricing {
    ModelPricing {
        model,
        provider,
        tier,
        input_price_per_k: input,
        output_price_per_k: output,
    }
}

use ModelTier::{Fast, Premium, Standard};
use ProviderId::{Anthropic, Cohere, Google, Groq, Mistral, OpenAI, Perplexity, Together};

pub const MODEL_PRICING: &[ModelPricing] = &[
    entry("gpt-4o", OpenAI, 0.005, 0.015, Premium),
    entry("gpt-4o-mini", OpenAI, 0.00015, 0.0006, Fast),
    entry("gpt-4-turbo", OpenAI, 0.01, 0.03, Premium),
    entry("gpt-4", OpenAI, 0.03, 0.06, Premium),
    entry("gpt-3.5-turbo", OpenAI, 0.0005, 0.0015, Fast),
    entry("claude-3-opus", Anthropic, 0.015, 0.075, Premium),
    entry("claude-3-sonnet", Anthropic, 0.003, 0.015, Standard),
    entry("claude-3-haiku", Anthropic, 0.00025, 0.00125, Fast),
    entry("claude-3.5-sonnet", Anthropic, 0.003, 0.015, Premium),
    entry("gemini-1.5-pro", Google, 0.00125, 0.005, Premium),
    entry("gemini-1.5-flash", Google, 0.000075, 0.0003, Fast),
    entry("gemini-pro", Google, 0.0005, 0.0015, Standard),
    entry("llama-3.1-70b-versatile", Groq, 0.00059, 0.00079, Standard),
    entry("llama-3.1-8b-instant", Groq, 0.00005, 0.00008, Fast),
    entry("mixtral-8x7b-32768", Groq, 0.00024, 0.00024, Standard),
    entry("mistral-large", Mistral, 0.004, 0.012, Premium),
    entry("mistral-medium", Mistral, 0.0027, 0.0081, Standard),
    entry("mistral-small", Mistral, 0.001, 0.003, Fast),
    entry("meta-llama/Llama-3-70b-chat-hf", Together, 0.0009, 0.0009, Standard),
    entry("meta-llama/Llama-3-8b-chat-hf", Together, 0.0002, 0.0002, Fast),
    entry("llama-3.1-sonar-large-128k-online", Perplexity, 0.001, 0.001, Premium),
    entry("llama-3.1-sonar-small-128k-online", Perplexity, 0.0002, 0.0002, Fast),
    entry("command-r-plus", Cohere, 0.003, 0.015, Premium),
    entry("command-r", Cohere, 0.0005, 0.0015, Standard),
];

/// tier -> provider -> 同档位的代表模型
const TIER_MAP: &[(ModelTier, ProviderId, &str)] = &[
    (Premium, OpenAI, "gpt-4o"),
    (Premium, Anthropic, "claude-3.5-sonnet"),
    (Premium, Google, "gemini-1.5-pro"),
    (Premium, Groq, "llama-3.1-70b-versatile"),
    (Premium, Mistral, "mistral-large"),
    (Premium, Together, "meta-llama/Llama-3-70b-chat-hf"),
    (Premium, Perplexity, "llama-3.1-sonar-large-128k-online"),
    (Premium, Cohere, "command-r-plus"),
    (Standard, OpenAI, "gpt-4o-mini"),
    (Standard, Anthropic, "claude-3-sonnet"),
    (Standard, Google, "gemini-pro"),
    (Standard, Groq, "mixtral-8x7b-32768"),
    (Standard, Mistral, "mistral-medium"),
    (Standard, Together, "meta-llama/Llama-3-70b-chat-hf"),
    (Standard, Perplexity, "llama-3.1-sonar-small-128k-online"),
    (Standard, Cohere, "command-r"),
    (Fast, OpenAI, "gpt-3.5-turbo"),
    (Fast, Anthropic, "claude-3-haiku"),
    (Fast, Google, "gemini-1.5-flash"),
    (Fast, Groq, "llama-3.1-8b-instant"),
    (Fast, Mistral, "mistral-small"),
    (Fast, Together, "meta-llama/Llama-3-8b-chat-hf"),
    (Fast, Perplexity, "llama-3.1-sonar-small-128k-online"),
    (Fast, Cohere, "command-r"),
];

pub fn pricing(model: &str) -> Option<&'static ModelPricing> {
    MODEL_PRICING.iter().find(|p| p.model == model)
}

/// 未知模型按 standard 处理
pub fn model_tier(model: &str) -> ModelTier {
    pricing(model).map(|p| p.tier).unwrap_or(Standard)
}

/// 未知模型的成本记为 0
pub fn calculate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    match pricing(model) {
        Some(p) => {
            f64::from(input_tokens) / 1000.0 * p.input_price_per_k
                + f64::from(output_tokens) / 1000.0 * p.output_price_per_k
        }
        None => 0.0,
    }
}

pub fn equivalent_model(tier: ModelTier, provider: ProviderId) -> Option<&'static str> {
    TIER_MAP
        .iter()
        .find(|(t, p, _)| *t == tier && *p == provider)
        .map(|(_, _, m)| *m)
}

/// 每个 provider 上与 `model` 同档位的模型（仅用于展示，路由不会自动使用）
pub fn equivalents(model: &str) -> Vec<(ProviderId, &'static str)> {
    let tier = model_tier(model);
    ProviderId::ALL
        .into_iter()
        .filter_map(|p| equivalent_model(tier, p).map(|m| (p, m)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_cost() {
        let cost = calculate_cost("gpt-4o", 5, 3);
        let expected = 5.0 / 1000.0 * 0.005 + 3.0 / 1000.0 * 0.015;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn unknown_models_are_free_and_standard() {
        assert_eq!(calculate_cost("my-finetune", 1000, 1000), 0.0);
        assert_eq!(model_tier("my-finetune"), ModelTier::Standard);
    }

    #[test]
    fn tier_map_covers_every_provider() {
        for tier in [Premium, Standard, Fast] {
            for p in ProviderId::ALL {
                assert!(equivalent_model(tier, p).is_some(), "{tier:?}/{p}");
            }
        }
        let eq = equivalents("claude-3-haiku");
        assert!(eq.contains(&(OpenAI, "gpt-3.5-turbo")));
        assert_eq!(eq.len(), ProviderId::ALL.len());
    }
}
