//! External collaborator seam for variable substitution (see SPEC_FULL.md
//! PURPOSE & SCOPE: template rendering is out of scope for the core). The
//! orchestrator only depends on `TemplateRenderer`; the ingestion skill's
//! real Jinja-style engine plugs in here in production. `PlaceholderRenderer`
//! is a conforming implementation, sufficient for the CLI and for the test
//! suite's own fixtures.

use crate::domain::ProductRequest;
use crate::domain::RecipientRecord;
use crate::errors::CoreError;

#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, product: &ProductRequest, recipient: &RecipientRecord) -> Result<RenderedMessage, CoreError>;
}

/// Substitutes `{{field}}` tokens in `product.subject`/`product.body_template`
/// with the product's and recipient's own fields. No conditionals, loops, or
/// escaping beyond that: real variable substitution is the ingestion skill's
/// job, not the kernel's.
pub struct PlaceholderRenderer;

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, product: &ProductRequest, recipient: &RecipientRecord) -> Result<RenderedMessage, CoreError> {
        Ok(RenderedMessage {
            subject: substitute(&product.subject, product, recipient),
            body: substitute(&product.body_template, product, recipient),
        })
    }
}

fn substitute(template: &str, product: &ProductRequest, recipient: &RecipientRecord) -> String {
    template
        .replace("{{company_name}}", &recipient.company_name)
        .replace("{{email}}", &recipient.email)
        .replace("{{maker_code}}", &product.maker_code)
        .replace("{{product_url}}", &product.product_url)
        .replace("{{quantity}}", &product.quantity)
}
