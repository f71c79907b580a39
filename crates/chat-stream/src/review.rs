//! Code review requests: a fixed prompt around a selected snippet, streamed
//! back as markdown.

use crate::error::Error;
use crate::orchestrator::{StreamFailure, StreamHandler};
use crate::types::chat::{ChatCompletionParams, ChatMessage, Delta};

const DEFAULT_LANGUAGE: &str = "English";

/// Separates [`CodeReview::heading`] from the streamed review text.
pub const SPLITTER: &str = "### ---------";

const CHECKLIST: &str = "\
Description:
A code review is a thorough inspection of code aimed at finding latent problems, \
raising quality and maintainability, and sharing knowledge inside the team. \
Pay attention to the following:

1. Whether the logic and functionality are implemented correctly
2. Whether the code follows coding conventions and established practice
3. Whether there are potential security holes or performance problems
4. Whether the code is easy to understand and maintain
5. Whether there are enough comments
6. Describe every problem as an item of a list
";

#[derive(Debug, Clone)]
pub struct CodeReview {
    code: String,
    language: String,
}

impl CodeReview {
    /// Fails when `code` is blank, since there is nothing to review.
    pub fn new(code: impl AsRef<str>) -> Result<Self, Error> {
        let code = code.as_ref().trim();
        if code.is_empty() {
            return Err(Error::Config("no code selected for review".to_string()));
        }
        Ok(Self {
            code: code.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
        })
    }

    /// Natural language the review should be written in.
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn system_prompt(&self) -> String {
        format!(
            "Analyze the given code for code smells and suggest improvements, \
             you can only response on markdown format. response in {}.",
            self.language
        )
    }

    /// Request body for `model`; an empty model lets the client fill in its
    /// configured default.
    pub fn params(&self, model: impl Into<String>) -> ChatCompletionParams {
        ChatCompletionParams {
            model: model.into(),
            messages: vec![
                ChatMessage::system(self.system_prompt()),
                ChatMessage::assistant(CHECKLIST),
                ChatMessage::user(format!("\"{}\"", self.code)),
            ],
            temperature: Some(0.0),
            max_tokens: Some(2000),
            top_p: Some(1.0),
            frequency_penalty: Some(1.0),
            presence_penalty: Some(1.0),
            stream: Some(true),
            ..Default::default()
        }
    }

    /// Markdown header shown above the streamed review, ending in
    /// [`SPLITTER`].
    pub fn heading(&self) -> String {
        format!(
            "## Reviewed code\n```\n{}\n\n```\n\n----  \n{SPLITTER}  \n",
            self.code
        )
    }
}

/// Review text of a rendered document, i.e. everything after the splitter.
/// Documents without a splitter are returned whole.
pub fn review_body(document: &str) -> &str {
    match document.split_once(SPLITTER) {
        Some((_, body)) => body,
        None => document,
    }
}

/// Accumulates a streamed review.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub finish_reason: Option<String>,
    pub error: Option<String>,
}

impl Transcript {
    pub fn is_done(&self) -> bool {
        self.finish_reason.is_some() || self.error.is_some()
    }
}

impl StreamHandler for Transcript {
    fn on_message(&mut self, delta: Delta) {
        // role announcements carry no review text
        if delta.role.is_some() {
            return;
        }
        self.text.push_str(&delta.content);
    }

    fn on_error(&mut self, failure: StreamFailure) {
        self.error = Some(failure.to_string());
    }

    fn on_finish(&mut self, reason: String) {
        self.finish_reason = Some(reason);
    }
}
