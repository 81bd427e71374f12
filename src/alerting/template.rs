//! Alert template rendering
//!
//! Titles and descriptions support `{name}` placeholders substituted
//! from the event context. Unknown placeholders are left literal so a
//! typo in a rule renders visibly instead of erroring.
//!
//! Context keys available to every change type: `change_type`,
//! `summary`, `description`, `severity`, `impact_score`, `detected_at`.
//! Asset-bearing events add `asset_name`, `asset_ip`, `environment`,
//! `datacenter`. Dependency events add `source_asset`, `target_asset`,
//! `target_port`, `protocol`.

use crate::types::{Asset, ChangeEvent};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").unwrap_or_else(|_| unreachable!()))
}

/// Substitute `{name}` placeholders from the context map.
pub fn render(template: &str, context: &HashMap<String, String>) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            context
                .get(key)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Build the rendering context for one event.
pub fn event_context(
    event: &ChangeEvent,
    asset: Option<&Asset>,
    source_asset: Option<&Asset>,
    target_asset: Option<&Asset>,
) -> HashMap<String, String> {
    let mut context = HashMap::from([
        ("change_type".to_string(), event.change_type.to_string()),
        ("summary".to_string(), event.summary.clone()),
        (
            "description".to_string(),
            event.description.clone().unwrap_or_default(),
        ),
        ("impact_score".to_string(), event.impact_score.to_string()),
        ("detected_at".to_string(), event.detected_at.to_rfc3339()),
    ]);

    if let Some(asset) = asset {
        context.insert("asset_name".to_string(), asset.name.clone());
        context.insert("asset_ip".to_string(), asset.ip_address.to_string());
        if let Some(ref env) = asset.environment {
            context.insert("environment".to_string(), env.clone());
        }
        if let Some(ref dc) = asset.datacenter {
            context.insert("datacenter".to_string(), dc.clone());
        }
    }
    if let Some(source) = source_asset {
        context.insert("source_asset".to_string(), source.name.clone());
    }
    if let Some(target) = target_asset {
        context.insert("target_asset".to_string(), target.name.clone());
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_known_placeholders() {
        let context = HashMap::from([
            ("change_type".to_string(), "dependency_created".to_string()),
            ("asset_name".to_string(), "db-01".to_string()),
        ]);
        assert_eq!(
            render("{change_type} on {asset_name}", &context),
            "dependency_created on db-01"
        );
    }

    #[test]
    fn test_unknown_placeholder_left_literal() {
        let context = HashMap::from([("summary".to_string(), "x".to_string())]);
        assert_eq!(render("{summary} {nope}", &context), "x {nope}");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(render("no placeholders here", &HashMap::new()), "no placeholders here");
    }
}
