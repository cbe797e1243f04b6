use log::{debug, error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::ConfigError;

const GOOGLE_ENDPOINT: &str = "https://translate.googleapis.com/translate_a/single";
const DEEPL_ENDPOINT: &str = "https://api-free.deepl.com/v2/translate";

// ─── Provider selection ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    DeepL,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Google => f.write_str("Google"),
            Provider::DeepL => f.write_str("DeepL"),
        }
    }
}

/// Shared engine toggle. Reads happen once per translation, so flipping it
/// never affects a request already in flight.
#[derive(Clone)]
pub struct ProviderSwitch {
    use_deepl: Arc<AtomicBool>,
}

impl ProviderSwitch {
    pub fn new(initial: Provider) -> Self {
        Self {
            use_deepl: Arc::new(AtomicBool::new(initial == Provider::DeepL)),
        }
    }

    pub fn current(&self) -> Provider {
        if self.use_deepl.load(Ordering::SeqCst) {
            Provider::DeepL
        } else {
            Provider::Google
        }
    }

    /// Flip the engine and return the new one.
    pub fn toggle(&self) -> Provider {
        let was_deepl = self.use_deepl.fetch_xor(true, Ordering::SeqCst);
        let now = if was_deepl { Provider::Google } else { Provider::DeepL };
        info!("Translation engine switched to {}", now);
        now
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("DeepL returned HTTP {status}: {reason}")]
    Status {
        status: u16,
        reason: String,
        body: String,
    },
    #[error("unrecognized response body")]
    BadResponse { body: String },
    #[error("DeepL API key is not set")]
    MissingApiKey,
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

fn describe_status(status: u16) -> String {
    match status {
        403 => "Invalid API key".into(),
        429 => "Rate limit exceeded, please wait".into(),
        456 => "Translation quota exceeded".into(),
        other => format!("unexpected status {}", other),
    }
}

// ─── Translator capability ───────────────────────────────────────────

pub trait Translator: Send + Sync + 'static {
    fn translate(
        &self,
        text: &str,
        target_lang: &str,
        provider: Provider,
    ) -> impl Future<Output = Result<String, TranslateError>> + Send;
}

/// Talks to the public Google endpoint or DeepL's free API over HTTPS.
pub struct HttpTranslator {
    client: reqwest::Client,
    api_key: String,
    google_url: String,
    deepl_url: String,
}

impl HttpTranslator {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, TranslateError> {
        Self::with_endpoints(api_key, timeout, GOOGLE_ENDPOINT, DEEPL_ENDPOINT)
    }

    pub fn with_endpoints(
        api_key: String,
        timeout: Duration,
        google_url: impl Into<String>,
        deepl_url: impl Into<String>,
    ) -> Result<Self, TranslateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            google_url: google_url.into(),
            deepl_url: deepl_url.into(),
        })
    }

    async fn translate_google(&self, text: &str, target_lang: &str) -> Result<String, TranslateError> {
        let body = self
            .client
            .get(&self.google_url)
            .query(&[
                ("client", "gtx"),
                ("sl", "auto"),
                ("tl", target_lang),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await?
            .text()
            .await?;

        extract_google_translation(&body).ok_or_else(|| {
            warn!("Google response had no translation: {}", truncate_body(&body));
            TranslateError::BadResponse { body }
        })
    }

    async fn translate_deepl(&self, text: &str, target_lang: &str) -> Result<String, TranslateError> {
        if self.api_key.is_empty() {
            return Err(TranslateError::MissingApiKey);
        }

        let target = target_lang.to_uppercase();
        let response = self
            .client
            .post(&self.deepl_url)
            .form(&[
                ("auth_key", self.api_key.as_str()),
                ("text", text),
                ("target_lang", target.as_str()),
            ])
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        parse_deepl_response(status, body)
    }
}

impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        provider: Provider,
    ) -> Result<String, TranslateError> {
        debug!("translating {} chars via {} -> {}", text.len(), provider, target_lang);
        match provider {
            Provider::Google => self.translate_google(text, target_lang).await,
            Provider::DeepL => self.translate_deepl(text, target_lang).await,
        }
    }
}

// ─── Response parsing ────────────────────────────────────────────────

/// Pull the translated sentence(s) out of a `translate_a/single` body,
/// shaped like `[[["translated","source",...],...],null,"en",...]`.
pub fn extract_google_translation(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let translated: String = value
            .get(0)?
            .as_array()?
            .iter()
            .filter_map(|seg| seg.get(0).and_then(|s| s.as_str()))
            .collect();
        return (!translated.is_empty()).then_some(translated);
    }

    // Not JSON: fall back to the first quoted string after `[[[`.
    static FALLBACK: OnceLock<Regex> = OnceLock::new();
    let re = FALLBACK.get_or_init(|| Regex::new(r#"\[\[\["(.*?)""#).expect("fallback pattern is valid"));
    re.captures(body).map(|c| c[1].to_string())
}

/// Interpret a DeepL reply. Any non-2xx status is a failure whatever the
/// body says; on success the first `text` field is the translation.
pub fn parse_deepl_response(status: u16, body: String) -> Result<String, TranslateError> {
    if !(200..300).contains(&status) {
        error!("DeepL API error: status {}, body: {}", status, truncate_body(&body));
        return Err(TranslateError::Status {
            status,
            reason: describe_status(status),
            body,
        });
    }

    let text = serde_json::from_str::<serde_json::Value>(&body).ok().and_then(|v| {
        v.get("translations")
            .and_then(|t| t.get(0))
            .and_then(|t| t.get("text"))
            .or_else(|| v.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
    });

    match text {
        Some(text) => Ok(text),
        None => {
            error!("Failed to parse DeepL response: {}", truncate_body(&body));
            Err(TranslateError::BadResponse { body })
        }
    }
}

/// Reject target codes DeepL does not know.
pub fn validate_deepl_target(target_lang: &str) -> Result<(), ConfigError> {
    target_lang
        .to_uppercase()
        .parse::<deepl::Lang>()
        .map(|_| ())
        .map_err(|_| ConfigError::UnsupportedLanguage(target_lang.to_string()))
}

fn truncate_body(s: &str) -> &str {
    const MAX: usize = 300;
    if s.len() <= MAX {
        return s;
    }
    let mut end = MAX;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
