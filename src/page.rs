//! Test page rendering.
//!
//! The page is a static HTML template. Before it is served, relative asset
//! references are pointed at the asset base and the client-side settings are
//! injected as a script ahead of `</head>`.

use std::path::Path;

use serde::Serialize;

use crate::config::TestConfig;
use crate::error::{Result, SpeedtestError};

/// Template compiled into the binary, used when no override is configured.
pub const DEFAULT_TEMPLATE: &str = include_str!("../assets/speedtest.html");

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PageSettings {
    test_duration: u32,
    ping_count: u32,
    #[serde(rename = "enableGeoIP")]
    enable_geo_ip: bool,
}

/// Read a template override from disk.
pub async fn load_template(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SpeedtestError::Template {
            path: path.display().to_string(),
            source,
        })
}

/// Render `template` for the current settings.
pub fn render(template: &str, asset_base: &str, config: &TestConfig) -> Result<String> {
    let base = asset_base.trim_end_matches('/');
    let html = template
        .replace(r#"src="../../"#, &format!(r#"src="{base}/"#))
        .replace(r#"href="../../"#, &format!(r#"href="{base}/"#));

    let settings = serde_json::to_string(&PageSettings {
        test_duration: config.test_duration,
        ping_count: config.ping_count,
        enable_geo_ip: config.enable_geo_ip,
    })?;
    let script = format!("<script>window.speedtestSettings = {settings};</script>");

    Ok(html.replacen("</head>", &format!("{script}</head>"), 1))
}
