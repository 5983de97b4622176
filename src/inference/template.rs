//! Prompt formats wrapped around every request before it reaches the engine.

use serde::{Deserialize, Serialize};

const LLAMA3_FORMAT: &str = "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n\
{system_prompt}<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n\
{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n";

const CHATML_FORMAT: &str = "<|im_start|>system\n{system_prompt}<|im_end|>\n\
<|im_start|>user\n{prompt}<|im_end|>\n\
<|im_start|>assistant\n";

/// Prompt template. Chosen in configuration, never by the user at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PromptTemplate {
    /// Llama 3 instruct header format.
    Llama3,

    /// ChatML (`<|im_start|>role ... <|im_end|>`).
    #[serde(rename = "chatml")]
    ChatMl,

    /// Custom format with `{system_prompt}` and `{prompt}` placeholders.
    Custom { format: String },
}

impl PromptTemplate {
    fn format(&self) -> &str {
        match self {
            PromptTemplate::Llama3 => LLAMA3_FORMAT,
            PromptTemplate::ChatMl => CHATML_FORMAT,
            PromptTemplate::Custom { format } => format,
        }
    }

    /// Wrap a raw user prompt.
    pub fn render(&self, system_prompt: &str, prompt: &str) -> String {
        fill_placeholders(
            self.format(),
            &[("{system_prompt}", system_prompt), ("{prompt}", prompt)],
        )
    }
}

/// Substitute placeholders in a single left-to-right pass.
///
/// Substituted text is never scanned again, so a user prompt containing
/// `{prompt}` is inserted literally.
pub fn fill_placeholders(format: &str, values: &[(&str, &str)]) -> String {
    let extra: usize = values.iter().map(|(_, v)| v.len()).sum();
    let mut out = String::with_capacity(format.len() + extra);
    let mut rest = format;

    while !rest.is_empty() {
        let next = values
            .iter()
            .filter_map(|(key, value)| rest.find(key).map(|pos| (pos, *key, *value)))
            .min_by_key(|(pos, _, _)| *pos);

        match next {
            Some((pos, key, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + key.len()..];
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }

    out
}
