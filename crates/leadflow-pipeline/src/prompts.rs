//! Prompt templates with `{{placeholder}}` substitution.
//!
//! A campaign may carry its own templates under `config.prompts.<stage>`.
//! Available placeholders: `lead_name`, `lead_email`, `campaign_name`,
//! `campaign_type`, `tone`, `answers`, plus every key of the stage context
//! (`analysis`, `response`).

use crate::collaborators::PromptRenderer;
use crate::stage::Stage;
use leadflow_core::{Campaign, Lead, LeadflowError, LeadflowResult};
use std::collections::HashMap;

pub const ANALYSIS_TEMPLATE: &str = r#"You are analysing answers to the "{{campaign_name}}" {{campaign_type}}.

Respondent: {{lead_name}}
Answers:
{{answers}}

Describe the respondent's profile, main interests, pain points and purchase intent."#;

pub const RESPONSE_TEMPLATE: &str = r#"Write the personalised result page for {{lead_name}}, who completed the "{{campaign_name}}" {{campaign_type}}.
Tone: {{tone}}.

Analysis of their answers:
{{analysis}}

Address them by name, explain what their answers say about them and suggest one concrete next step."#;

pub const EMAIL_TEMPLATE: &str = r#"Write a follow-up email to {{lead_name}} about the "{{campaign_name}}" {{campaign_type}}.
Tone: {{tone}}.

Their personalised result:
{{response}}

Return a subject line and a short plain-text body."#;

const DEFAULT_TONE: &str = "friendly and professional";

/// Renders stage prompts from campaign templates, falling back to the built-in ones.
#[derive(Debug, Clone, Default)]
pub struct TemplatePromptRenderer {
    strict: bool,
}

impl TemplatePromptRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every campaign to carry its own templates.
    pub fn strict() -> Self {
        Self { strict: true }
    }

    fn builtin(stage: Stage) -> Option<&'static str> {
        match stage {
            Stage::Analysis => Some(ANALYSIS_TEMPLATE),
            Stage::ResponseGeneration => Some(RESPONSE_TEMPLATE),
            Stage::EmailGeneration => Some(EMAIL_TEMPLATE),
            _ => None,
        }
    }

    fn template<'a>(&self, stage: Stage, campaign: &'a Campaign) -> LeadflowResult<&'a str> {
        let custom = campaign
            .config
            .get("prompts")
            .and_then(|p| p.get(stage.as_str()))
            .and_then(|t| t.as_str());
        match custom {
            Some(template) => Ok(template),
            None if self.strict => Err(LeadflowError::Template(format!(
                "campaign {} has no {stage} template",
                campaign.id
            ))),
            None => Self::builtin(stage)
                .ok_or_else(|| LeadflowError::Template(format!("no template for stage {stage}"))),
        }
    }
}

fn text_of(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Replace every `{{key}}` in `template` in one left-to-right pass.
///
/// Substituted values are copied verbatim and never scanned for placeholders.
/// Unknown keys are an error; an unterminated `{{` is kept as text.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> LeadflowResult<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            rendered.push_str(&rest[open..]);
            return Ok(rendered);
        };
        let name = after[..close].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| LeadflowError::Template(format!("unresolved placeholder: {name}")))?;
        rendered.push_str(value);
        rest = &after[close + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

impl PromptRenderer for TemplatePromptRenderer {
    fn render(
        &self,
        stage: Stage,
        lead: &Lead,
        campaign: &Campaign,
        context: &serde_json::Value,
    ) -> LeadflowResult<String> {
        let template = self.template(stage, campaign)?;

        let mut vars = HashMap::new();
        vars.insert("lead_name".to_string(), lead.name.clone());
        vars.insert("lead_email".to_string(), lead.email.clone().unwrap_or_default());
        vars.insert("campaign_name".to_string(), campaign.name.clone());
        vars.insert("campaign_type".to_string(), campaign.campaign_type.clone());
        vars.insert(
            "tone".to_string(),
            campaign.config_str("tone").unwrap_or(DEFAULT_TONE).to_string(),
        );
        vars.insert("answers".to_string(), text_of(&lead.answers));
        if let Some(entries) = context.as_object() {
            for (key, value) in entries {
                vars.insert(key.clone(), text_of(value));
            }
        }

        render_template(template, &vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lead() -> Lead {
        Lead::new(42, 7, "Ada").with_answers(json!({"goal": "strength"}))
    }

    #[test]
    fn test_builtin_analysis_prompt() {
        let campaign = Campaign::new(7, "Fitness quiz");
        let prompt = TemplatePromptRenderer::new()
            .render(Stage::Analysis, &lead(), &campaign, &json!({}))
            .unwrap();
        assert!(prompt.contains("Respondent: Ada"));
        assert!(prompt.contains("\"goal\": \"strength\""));
        assert!(prompt.contains("\"Fitness quiz\" quiz"));
    }

    #[test]
    fn test_campaign_template_and_context() {
        let campaign = Campaign::new(7, "Fitness quiz").with_config(json!({
            "tone": "playful",
            "prompts": {"response_generation": "{{lead_name}} / {{tone}} / {{analysis}}"}
        }));
        let prompt = TemplatePromptRenderer::strict()
            .render(
                Stage::ResponseGeneration,
                &lead(),
                &campaign,
                &json!({"analysis": "likes lifting"}),
            )
            .unwrap();
        assert_eq!(prompt, "Ada / playful / likes lifting");
    }

    #[test]
    fn test_strict_renderer_requires_template() {
        let err = TemplatePromptRenderer::strict()
            .render(Stage::Analysis, &lead(), &Campaign::new(7, "Quiz"), &json!({}))
            .unwrap_err();
        assert!(matches!(err, LeadflowError::Template(_)));
    }

    #[test]
    fn test_unresolved_placeholder() {
        let err = render_template("Hi {{ missing }}", &HashMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "Template error: unresolved placeholder: missing");
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let lead = Lead::new(50, 7, "{{answers}}")
            .with_answers(json!({"note": "I write {{ mustache }} templates"}));
        let campaign = Campaign::new(7, "Quiz").with_config(json!({
            "prompts": {"analysis": "{{lead_name}} said {{answers}}"}
        }));
        let prompt = TemplatePromptRenderer::new()
            .render(Stage::Analysis, &lead, &campaign, &json!({}))
            .unwrap();
        assert!(prompt.starts_with("{{answers}} said "));
        assert!(prompt.contains("I write {{ mustache }} templates"));
    }

    #[test]
    fn test_unterminated_marker_is_text() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        assert_eq!(
            render_template("{{ name }} likes {{ braces", &vars).unwrap(),
            "Ada likes {{ braces"
        );
    }

    #[test]
    fn test_response_prompt_needs_analysis() {
        let err = TemplatePromptRenderer::new()
            .render(Stage::ResponseGeneration, &lead(), &Campaign::new(7, "Quiz"), &json!({}))
            .unwrap_err();
        assert!(matches!(err, LeadflowError::Template(_)));
    }
}
