use std::sync::Arc;

mod source;
mod template;

pub use source::{
    BoxFuture, Prompt, PromptMessage, ResponseBody, ResponseSource, Role, SourceError,
    SourceResult,
};
pub use template::{TEMPLATE_SOURCE_ID, TemplateSource, default_templates};

/// Builds the response source named by `kind`.
///
/// An empty `templates` list selects the built-in pool.
pub fn create_source(kind: &str, templates: Vec<String>) -> SourceResult<Arc<dyn ResponseSource>> {
    match kind.trim() {
        "" | TEMPLATE_SOURCE_ID | "mock" => {
            if templates.is_empty() {
                Ok(Arc::new(TemplateSource::with_default_templates()))
            } else {
                Ok(Arc::new(TemplateSource::new(templates)?))
            }
        }
        other => Err(SourceError::UnsupportedSource {
            stage: "create-source",
            kind: other.to_string(),
        }),
    }
}
