use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{AppError, Context, Result};

/// Render an endpoint template for `symbol`.
///
/// Supported placeholders are `{symbol}`, `{symbol_lower}` and `${ENV_VAR}`.
pub fn prepare_url(template: &str, symbol: &str) -> Result<String> {
    let replacements = HashMap::from([
        ("symbol", symbol.to_string()),
        ("symbol_lower", symbol.to_lowercase()),
    ]);
    render_template(template, &replacements)
}

/// Expand `${NAME}` placeholders from the process environment.
pub fn expand_env_vars(value: &str) -> Result<String> {
    render_template(value, &HashMap::new())
}

pub fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("Invalid header name: {}", key))?;
        let expanded = expand_env_vars(value)?;
        let header_value = HeaderValue::from_str(&expanded)
            .with_context(|| format!("Invalid header value for {}", key))?;
        map.insert(name, header_value);
    }
    Ok(map)
}

/// Strip the query string so API keys never reach logs or dumps.
pub fn redact_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

fn render_template(template: &str, replacements: &HashMap<&str, String>) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        let from_env = ch == '$' && matches!(chars.peek(), Some('{'));
        if from_env {
            chars.next();
        } else if ch != '{' {
            result.push(ch);
            continue;
        }

        let mut key = String::new();
        let mut closed = false;
        for next in chars.by_ref() {
            if next == '}' {
                closed = true;
                break;
            }
            key.push(next);
        }

        if !closed {
            return Err(AppError::message(format!(
                "Unterminated placeholder in template: {{{key}"
            )));
        }

        if key.is_empty() {
            return Err(AppError::message(
                "Encountered empty placeholder `{}` in template",
            ));
        }

        if from_env {
            let value = std::env::var(&key).with_context(|| {
                format!("Environment variable {} required by template is not set", key)
            })?;
            result.push_str(&value);
        } else {
            let value = replacements.get(key.as_str()).ok_or_else(|| {
                AppError::message(format!(
                    "No replacement provided for placeholder `{}` in template",
                    key
                ))
            })?;
            result.push_str(value);
        }
    }

    Ok(result)
}
