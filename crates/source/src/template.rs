use rand::seq::SliceRandom;
use snafu::{OptionExt, ensure};

use super::source::{
    BoxFuture, EmptyTemplatePoolSnafu, Prompt, ResponseBody, ResponseSource, SourceResult,
};

pub const TEMPLATE_SOURCE_ID: &str = "template";

pub fn default_templates() -> Vec<String> {
    vec![
        "That's a great question! Let me help you understand this concept better. The key thing to remember is that proper implementation requires careful consideration of the underlying principles and best practices in the field.".to_string(),
        "I'd be happy to explain this topic in detail. From my understanding, there are several important factors to consider when approaching this problem. Let me break it down step by step for you.".to_string(),
        "This is an interesting topic that comes up frequently. The solution typically involves understanding the core concepts and applying them in the right context. Here's what I recommend...".to_string(),
    ]
}

/// Answers every prompt with a template drawn uniformly from a fixed pool.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    templates: Vec<String>,
}

impl TemplateSource {
    pub fn new(templates: Vec<String>) -> SourceResult<Self> {
        let templates = templates
            .into_iter()
            .map(|template| template.trim().to_string())
            .filter(|template| !template.is_empty())
            .collect::<Vec<_>>();

        ensure!(
            !templates.is_empty(),
            EmptyTemplatePoolSnafu {
                stage: "template-source-new",
                source_id: TEMPLATE_SOURCE_ID,
            }
        );

        Ok(Self { templates })
    }

    pub fn with_default_templates() -> Self {
        Self {
            templates: default_templates(),
        }
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    fn pick(&self) -> SourceResult<String> {
        self.templates
            .choose(&mut rand::thread_rng())
            .cloned()
            .context(EmptyTemplatePoolSnafu {
                stage: "template-source-pick",
                source_id: TEMPLATE_SOURCE_ID,
            })
    }
}

impl ResponseSource for TemplateSource {
    fn id(&self) -> &str {
        TEMPLATE_SOURCE_ID
    }

    fn respond<'a>(&'a self, prompt: &'a Prompt) -> BoxFuture<'a, SourceResult<ResponseBody>> {
        let picked = self.pick();
        Box::pin(async move {
            let picked = picked?;
            tracing::debug!(
                prompt_messages = prompt.messages.len(),
                reply_chars = picked.chars().count(),
                "template source picked reply"
            );
            Ok(ResponseBody::Text(picked))
        })
    }
}
