//! The external LLM call that turns the assembled prompt into a CI config.

use std::str::FromStr;

use serde_json::{json, Value};
use snafu::{OptionExt, ResultExt, Snafu};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";
const MAX_TOKENS: u32 = 8192;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("unknown LLM provider {given:?} (expected anthropic or openai)"))]
    UnknownProvider { given: String },
    #[snafu(display("request to {url} failed"))]
    Http { source: reqwest::Error, url: String },
    #[snafu(display("{url} returned {status}: {body}"))]
    Api {
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("response carried no text content"))]
    MissingContent,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LlmProvider {
    Anthropic,
    OpenAi,
}

impl FromStr for LlmProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "anthropic" => Ok(LlmProvider::Anthropic),
            "openai" => Ok(LlmProvider::OpenAi),
            other => UnknownProviderSnafu { given: other }.fail(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: String,
    pub model: Option<String>,
}

impl LlmConfig {
    fn model(&self) -> &str {
        match (&self.model, self.provider) {
            (Some(model), _) => model,
            (None, LlmProvider::Anthropic) => ANTHROPIC_DEFAULT_MODEL,
            (None, LlmProvider::OpenAi) => OPENAI_DEFAULT_MODEL,
        }
    }
}

/// Sends the prompt and returns the model's raw text, fences stripped.
pub async fn generate_config(config: &LlmConfig, system: &str, user: &str) -> Result<String> {
    let client = reqwest::Client::new();
    let (url, request) = match config.provider {
        LlmProvider::Anthropic => (
            ANTHROPIC_URL,
            client
                .post(ANTHROPIC_URL)
                .header("x-api-key", &config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": config.model(),
                    "max_tokens": MAX_TOKENS,
                    "system": system,
                    "messages": [{"role": "user", "content": user}],
                })),
        ),
        LlmProvider::OpenAi => (
            OPENAI_URL,
            client
                .post(OPENAI_URL)
                .bearer_auth(&config.api_key)
                .json(&json!({
                    "model": config.model(),
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                })),
        ),
    };

    let response = request.send().await.context(HttpSnafu { url })?;
    let status = response.status();
    let body = response.text().await.context(HttpSnafu { url })?;
    if !status.is_success() {
        return ApiSnafu {
            url,
            status: status.as_u16(),
            body,
        }
        .fail();
    }

    let parsed: Value = serde_json::from_str(&body).map_err(|_| Error::MissingContent)?;
    let text = match config.provider {
        LlmProvider::Anthropic => parsed
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .context(MissingContentSnafu)?,
        LlmProvider::OpenAi => parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .context(MissingContentSnafu)?,
    };
    Ok(strip_code_fences(text))
}

/// Removes a wrapping markdown code fence, if any, and trims whitespace.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // drop the fence's language tag line
    let rest = rest.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("name: dev-deploy\n", "name: dev-deploy")]
    #[case("```yaml\nname: dev-deploy\n```", "name: dev-deploy")]
    #[case("```\nname: dev-deploy\n```", "name: dev-deploy")]
    #[case("  \n```yaml\njobs: {}\n```\n  ", "jobs: {}")]
    fn fences_are_stripped(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_code_fences(input), expected);
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!(LlmProvider::from_str("anthropic").unwrap(), LlmProvider::Anthropic);
        assert_eq!(LlmProvider::from_str("openai").unwrap(), LlmProvider::OpenAi);
        assert!(LlmProvider::from_str("bard").is_err());
    }

    #[test]
    fn default_models_per_provider() {
        let anthropic = LlmConfig {
            provider: LlmProvider::Anthropic,
            api_key: "k".to_string(),
            model: None,
        };
        assert_eq!(anthropic.model(), ANTHROPIC_DEFAULT_MODEL);
        let overridden = LlmConfig {
            model: Some("claude-opus-4-20250514".to_string()),
            ..anthropic
        };
        assert_eq!(overridden.model(), "claude-opus-4-20250514");
    }
}
