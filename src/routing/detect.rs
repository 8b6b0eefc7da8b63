use crate::providers::{ProviderId, ProviderRegistry};

/// 名称启发式，按规则顺序匹配第一个命中的 provider
pub fn detect_by_name(model: &str) -> Option<ProviderId> {
    let m = model.to_ascii_lowercase();

    if m.starts_with("gpt-") || m.contains("openai") {
        return Some(ProviderId::OpenAI);
    }
    if m.starts_with("claude") {
        return Some(ProviderId::Anthropic);
    }
    if m.starts_with("gemini") {
        return Some(ProviderId::Google);
    }
    if m.contains("groq") {
        return Some(ProviderId::Groq);
    }
    if m.starts_with("mistral") || m.contains("mixtral") {
        return Some(ProviderId::Mistral);
    }
    if m.contains("meta-llama") || m.contains("qwen") || m.contains("together") {
        return Some(ProviderId::Together);
    }
    if m.contains("sonar") || m.contains("perplexity") {
        return Some(ProviderId::Perplexity);
    }
    if m.starts_with("command") {
        return Some(ProviderId::Cohere);
    }
    // 其余带组织前缀的 HF 风格名称（org/model）
    if m.contains('/') {
        return Some(ProviderId::Together);
    }
    None
}

/// 先走名称启发式，再按注册顺序扫描各 provider 的 `supports_model`。
/// 启发式命中但该 provider 未注册时继续扫描。
pub fn resolve_provider(model: &str, registry: &ProviderRegistry) -> Option<ProviderId> {
    detect_by_name(model)
        .filter(|id| registry.get(*id).is_some())
        .or_else(|| registry.find_supporting(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn name_rules() {
        let cases = [
            ("gpt-4o", Some(ProviderId::OpenAI)),
            ("ft:openai-custom", Some(ProviderId::OpenAI)),
            ("Claude-3-Haiku", Some(ProviderId::Anthropic)),
            ("gemini-1.5-pro", Some(ProviderId::Google)),
            ("llama3-groq-70b", Some(ProviderId::Groq)),
            ("mistral-large", Some(ProviderId::Mistral)),
            ("open-mixtral-8x7b", Some(ProviderId::Mistral)),
            ("meta-llama/Llama-3-8b-chat-hf", Some(ProviderId::Together)),
            ("Qwen/Qwen2-72B-Instruct", Some(ProviderId::Together)),
            ("deepseek-ai/deepseek-llm-67b-chat", Some(ProviderId::Together)),
            ("llama-3.1-sonar-small-128k-online", Some(ProviderId::Perplexity)),
            ("command-r-plus", Some(ProviderId::Cohere)),
            ("llama-3.1-8b-instant", None),
            ("totally-unknown", None),
        ];
        for (model, expected) in cases {
            assert_eq!(detect_by_name(model), expected, "{model}");
        }
    }

    #[test]
    fn registry_scan_is_the_fallback() {
        let registry = ProviderRegistry::from_settings(&Settings::default()).unwrap();
        assert_eq!(
            resolve_provider("llama-3.1-70b-versatile", &registry),
            Some(ProviderId::Groq)
        );
        assert_eq!(resolve_provider("gemma2-9b-it", &registry), Some(ProviderId::Groq));
        assert_eq!(resolve_provider("totally-unknown", &registry), None);
    }
}
