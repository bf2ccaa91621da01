//! Embedded payload templates.
//!
//! Node scripts, cloud-init documents and manifests live under
//! `templates/` and are compiled into the binary.

use handlebars::{no_escape, Handlebars};
use serde_json::Value;

use crate::error::{Error, Result};

pub(crate) const CLOUD_INIT: &str = include_str!("../templates/cloud-init.yaml.hbs");
pub(crate) const MASTER_SCRIPT: &str = include_str!("../templates/master.sh.hbs");
pub(crate) const WORKER_SCRIPT: &str = include_str!("../templates/worker.sh.hbs");
pub(crate) const SECRET: &str = include_str!("../templates/secret.yaml.hbs");
pub(crate) const UPGRADE_PLAN: &str = include_str!("../templates/upgrade-plan.yaml.hbs");
pub(crate) const AUTOSCALER: &str = include_str!("../templates/autoscaler.yaml.hbs");

/// Deployment override scheduling the CSI controller on masters.
pub(crate) const CSI_CONTROLLER: &str = include_str!("../templates/csi-controller.yaml");
/// `CSIDriver` object removed before the driver manifest is applied.
pub(crate) const CSI_DRIVER: &str = include_str!("../templates/csi-driver.yaml");

/// Render `template` with `context`.
///
/// Output is not HTML-escaped; payloads are shell and YAML.
pub(crate) fn render(name: &str, template: &str, context: &Value) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(no_escape);

    handlebars
        .register_template_string(name, template)
        .map_err(|e| Error::Config(format!("Failed to register {name} template: {e}")))?;

    handlebars
        .render(name, context)
        .map_err(|e| Error::Config(format!("Failed to render {name}: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_render_does_not_escape() {
        let out = render("t", "a {{v}} b", &json!({ "v": "\"x\" & <y>" })).unwrap();
        assert_eq!(out, "a \"x\" & <y> b");
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        assert!(render("t", "{{missing}}", &json!({})).is_err());
    }

    #[test]
    fn test_secret_template() {
        let out = render(
            "secret",
            SECRET,
            &json!({ "name": "hcloud", "data": { "network": "demo", "token": "abc" } }),
        )
        .unwrap();
        assert!(out.contains("  name: hcloud\n"));
        assert!(out.contains("  network: \"demo\""));
        assert!(out.contains("  token: \"abc\""));
    }
}
