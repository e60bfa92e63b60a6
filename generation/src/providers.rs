use async_openai::{config::OpenAIConfig, Client};
use common::{config::scoped::ChatSettings, error::AppError};
use serde::Serialize;

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Credentials snapshot. Reading the process environment once per request
/// keeps the selection function deterministic and unit-testable.
#[derive(Debug, Clone, Default)]
pub struct ProviderEnv {
    pub openrouter_api_key: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
}

impl ProviderEnv {
    pub fn from_process() -> Self {
        Self {
            openrouter_api_key: std::env::var("OPENROUTER_API_KEY").unwrap_or_default(),
            openai_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_base_url: std::env::var("OPENAI_BASE_URL").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenRouter,
    Local,
    CloudDirect,
}

/// Selected chat provider route. Enough to construct an OpenAI-compatible
/// client without further decisions.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRoute {
    pub kind: ProviderKind,
    pub provider_name: String,
    pub base_url: String,
    pub model: String,
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn normalize_local_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/v1")
        .unwrap_or(trimmed)
        .to_string()
}

/// Deterministic provider selection:
/// 1. explicit `local:` / `openrouter:` prefixes force that kind,
/// 2. `provider/model` ids route through OpenRouter when it is keyed,
/// 3. `openai/<model>` falls through to direct OpenAI,
/// 4. otherwise: OpenRouter, then the lowest-priority enabled local
///    provider (name tie-break), then direct OpenAI,
/// 5. nothing available is a configuration error.
pub fn select_provider_route(
    chat: &ChatSettings,
    openai_base_url_override: &str,
    model_override: &str,
    env: &ProviderEnv,
) -> Result<ProviderRoute, AppError> {
    let override_raw = model_override.trim();
    let openrouter_key = env.openrouter_api_key.trim();
    let openai_key = env.openai_api_key.trim();

    let openai_base_url = [env.openai_base_url.trim(), openai_base_url_override.trim()]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or(OPENAI_DEFAULT_BASE_URL)
        .to_string();

    let (override_kind, override_model) = match override_raw.split_once(':') {
        Some((prefix, rest)) if matches!(prefix.trim().to_lowercase().as_str(), "local" | "openrouter") => {
            (prefix.trim().to_lowercase(), rest.trim().to_string())
        }
        _ => (String::new(), override_raw.to_string()),
    };

    let mut enabled_local: Vec<_> = chat
        .local_providers
        .iter()
        .filter(|p| p.enabled)
        .collect();
    enabled_local.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    let openrouter_ready = chat.openrouter.enabled && !openrouter_key.is_empty();
    let openai_ready = !openai_key.is_empty();

    if override_kind == "local" {
        let Some(chosen) = enabled_local.first() else {
            return Err(AppError::Configuration(
                "no local providers enabled (chat.local_providers)".to_string(),
            ));
        };
        let model = if override_model.is_empty() {
            chat.default_local_model.clone()
        } else {
            override_model
        };
        return Ok(ProviderRoute {
            kind: ProviderKind::Local,
            provider_name: chosen.name.clone(),
            base_url: normalize_local_base_url(&chosen.base_url),
            model,
            api_key: None,
        });
    }

    if override_kind == "openrouter" {
        if !openrouter_ready {
            return Err(AppError::Configuration(
                "OpenRouter not ready (enable chat.openrouter and set OPENROUTER_API_KEY)"
                    .to_string(),
            ));
        }
        let model = if override_model.is_empty() {
            chat.openrouter.default_model.clone()
        } else {
            override_model
        };
        return Ok(ProviderRoute {
            kind: ProviderKind::OpenRouter,
            provider_name: "OpenRouter".to_string(),
            base_url: chat.openrouter.base_url.clone(),
            model,
            api_key: Some(openrouter_key.to_string()),
        });
    }

    // `provider/model` ids: the aggregator takes them all when keyed;
    // otherwise only the OpenAI slug routes directly.
    if let Some((provider_slug, model_name)) = override_model.split_once('/') {
        let provider_slug = provider_slug.trim().to_lowercase();
        let model_name = model_name.trim();

        if openrouter_ready {
            return Ok(ProviderRoute {
                kind: ProviderKind::OpenRouter,
                provider_name: "OpenRouter".to_string(),
                base_url: chat.openrouter.base_url.clone(),
                model: override_model.clone(),
                api_key: Some(openrouter_key.to_string()),
            });
        }

        if provider_slug == "openai" {
            if !openai_ready {
                return Err(AppError::Configuration(
                    "OpenAI not configured (set OPENAI_API_KEY)".to_string(),
                ));
            }
            if model_name.is_empty() {
                return Err(AppError::Configuration(
                    "invalid OpenAI model id (expected openai/<model>)".to_string(),
                ));
            }
            return Ok(ProviderRoute {
                kind: ProviderKind::CloudDirect,
                provider_name: "OpenAI".to_string(),
                base_url: openai_base_url,
                model: model_name.to_string(),
                api_key: Some(openai_key.to_string()),
            });
        }

        return Err(AppError::Configuration(format!(
            "cloud model '{override_model}' requires OpenRouter \
             (enable chat.openrouter and set OPENROUTER_API_KEY)"
        )));
    }

    if openrouter_ready {
        let model = if override_model.is_empty() {
            chat.openrouter.default_model.clone()
        } else {
            override_model
        };
        return Ok(ProviderRoute {
            kind: ProviderKind::OpenRouter,
            provider_name: "OpenRouter".to_string(),
            base_url: chat.openrouter.base_url.clone(),
            model,
            api_key: Some(openrouter_key.to_string()),
        });
    }

    if let Some(chosen) = enabled_local.first() {
        let model = if override_model.is_empty() {
            chat.default_local_model.clone()
        } else {
            override_model
        };
        return Ok(ProviderRoute {
            kind: ProviderKind::Local,
            provider_name: chosen.name.clone(),
            base_url: normalize_local_base_url(&chosen.base_url),
            model,
            api_key: None,
        });
    }

    if openai_ready {
        let model = if override_model.is_empty() {
            "gpt-4o-mini".to_string()
        } else {
            override_model
        };
        return Ok(ProviderRoute {
            kind: ProviderKind::CloudDirect,
            provider_name: "OpenAI".to_string(),
            base_url: openai_base_url,
            model,
            api_key: Some(openai_key.to_string()),
        });
    }

    Err(AppError::Configuration(
        "no chat provider configured: start a local provider, enable OpenRouter \
         (chat.openrouter + OPENROUTER_API_KEY), or set OPENAI_API_KEY"
            .to_string(),
    ))
}

/// Construct the OpenAI-compatible client for a selected route. Local
/// providers get a placeholder key; their servers ignore it.
pub fn build_client(route: &ProviderRoute) -> Client<OpenAIConfig> {
    let api_key = route.api_key.clone().unwrap_or_else(|| "sk-local".to_string());
    let base_url = if route.kind == ProviderKind::Local {
        format!("{}/v1", route.base_url.trim_end_matches('/'))
    } else {
        route.base_url.clone()
    };

    Client::with_config(
        OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::scoped::LocalProviderSettings;

    fn chat_with_local(providers: Vec<LocalProviderSettings>) -> ChatSettings {
        let mut chat = ChatSettings::default();
        chat.local_providers = providers;
        chat
    }

    fn local(name: &str, priority: u32, enabled: bool) -> LocalProviderSettings {
        LocalProviderSettings {
            name: name.to_string(),
            base_url: format!("http://localhost:1234/{name}/v1"),
            priority,
            enabled,
        }
    }

    fn env(openrouter: &str, openai: &str) -> ProviderEnv {
        ProviderEnv {
            openrouter_api_key: openrouter.to_string(),
            openai_api_key: openai.to_string(),
            openai_base_url: String::new(),
        }
    }

    #[test]
    fn no_provider_is_a_configuration_error() {
        let chat = ChatSettings::default();
        let err = select_provider_route(&chat, "", "", &env("", "")).expect_err("must fail");
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn openrouter_wins_when_enabled_and_keyed() {
        let mut chat = chat_with_local(vec![local("ollama", 1, true)]);
        chat.openrouter.enabled = true;

        let route =
            select_provider_route(&chat, "", "", &env("or-key", "oa-key")).expect("route");
        assert_eq!(route.kind, ProviderKind::OpenRouter);
        assert_eq!(route.model, chat.openrouter.default_model);
    }

    #[test]
    fn local_priority_breaks_ties_by_name() {
        let chat = chat_with_local(vec![
            local("zeta", 1, true),
            local("alpha", 1, true),
            local("fast", 0, false),
        ]);

        let route = select_provider_route(&chat, "", "", &env("", "")).expect("route");
        assert_eq!(route.kind, ProviderKind::Local);
        assert_eq!(route.provider_name, "alpha");
        assert!(!route.base_url.ends_with("/v1"), "local base url is normalized");
    }

    #[test]
    fn openai_is_the_last_fallback() {
        let chat = ChatSettings::default();
        let route = select_provider_route(&chat, "", "", &env("", "oa-key")).expect("route");
        assert_eq!(route.kind, ProviderKind::CloudDirect);
        assert_eq!(route.model, "gpt-4o-mini");
        assert_eq!(route.base_url, OPENAI_DEFAULT_BASE_URL);
    }

    #[test]
    fn explicit_local_prefix_forces_local() {
        let chat = chat_with_local(vec![local("ollama", 1, true)]);
        let route = select_provider_route(&chat, "", "local:llama3.2", &env("or", "oa"))
            .expect("route");
        assert_eq!(route.kind, ProviderKind::Local);
        assert_eq!(route.model, "llama3.2");
    }

    #[test]
    fn explicit_local_prefix_without_providers_errors() {
        let chat = ChatSettings::default();
        let err = select_provider_route(&chat, "", "local:llama3.2", &env("or", "oa"))
            .expect_err("must fail");
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn explicit_openrouter_prefix_requires_readiness() {
        let mut chat = ChatSettings::default();
        chat.openrouter.enabled = true;

        let route = select_provider_route(&chat, "", "openrouter:mistral-7b", &env("or", ""))
            .expect("route");
        assert_eq!(route.kind, ProviderKind::OpenRouter);
        assert_eq!(route.model, "mistral-7b");

        let err = select_provider_route(&chat, "", "openrouter:mistral-7b", &env("", ""))
            .expect_err("must fail without key");
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn provider_slash_model_routes_through_aggregator_when_keyed() {
        let mut chat = ChatSettings::default();
        chat.openrouter.enabled = true;

        let route = select_provider_route(&chat, "", "anthropic/claude-3", &env("or", "oa"))
            .expect("route");
        assert_eq!(route.kind, ProviderKind::OpenRouter);
        assert_eq!(route.model, "anthropic/claude-3");
    }

    #[test]
    fn openai_slug_routes_direct_without_aggregator() {
        let chat = ChatSettings::default();
        let route = select_provider_route(&chat, "", "openai/gpt-4o-mini", &env("", "oa"))
            .expect("route");
        assert_eq!(route.kind, ProviderKind::CloudDirect);
        assert_eq!(route.model, "gpt-4o-mini");
    }

    #[test]
    fn non_openai_slug_without_aggregator_errors() {
        let chat = ChatSettings::default();
        let err = select_provider_route(&chat, "", "anthropic/claude-3", &env("", "oa"))
            .expect_err("must fail");
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn base_url_override_applies_to_direct_openai() {
        let chat = ChatSettings::default();
        let route = select_provider_route(
            &chat,
            "https://proxy.internal/v1",
            "openai/gpt-4o-mini",
            &env("", "oa"),
        )
        .expect("route");
        assert_eq!(route.base_url, "https://proxy.internal/v1");
    }
}
