//! Stealth augmentations applied per browser context
//!
//! Standard evasions only (webdriver flag, languages, plugins, chrome
//! runtime, WebGL vendor) plus a user-agent override matching the
//! session's randomized UA. Scripts are embedded in the binary and
//! installed with `Page.addScriptToEvaluateOnNewDocument` so they run
//! before any site code on every navigation.

use anyhow::{Context, Result};
use chromiumoxide::{Page, cdp};
use tracing::{debug, warn};

// Injection order matters: the webdriver flag is probed first and
// cheapest to check, so it goes in first.
const EVASION_SCRIPTS: &[(&str, &str)] = &[
    (
        "navigator_webdriver",
        include_str!("js/navigator_webdriver.js"),
    ),
    (
        "navigator_languages",
        include_str!("js/navigator_languages.js"),
    ),
    ("navigator_plugins", include_str!("js/navigator_plugins.js")),
    ("chrome_runtime", include_str!("js/chrome_runtime.js")),
    ("webgl_vendor", include_str!("js/webgl_vendor.js")),
    ("canvas_noise", include_str!("js/canvas_noise.js")),
];

/// Platform string consistent with the session user agent.
fn platform_for(user_agent: &str) -> &'static str {
    if user_agent.contains("Macintosh") {
        "MacIntel"
    } else if user_agent.contains("X11") {
        "Linux x86_64"
    } else {
        "Win32"
    }
}

/// Install the evasion scripts and the user-agent override on a page.
///
/// Injection is best-effort per script; only a total failure is an
/// error, since one broken evasion still beats a bare headless profile.
pub async fn prepare(page: &Page, user_agent: &str) -> Result<()> {
    // Per-session seed for the canvas noise; must land before the
    // evasion scripts that read it.
    let seed: [u8; 16] = rand::random();
    page.execute(
        cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams {
            source: format!("window.__scrapeSeed = \"{}\";", hex::encode(seed)),
            include_command_line_api: None,
            world_name: None,
            run_immediately: None,
        },
    )
    .await
    .context("injecting session seed")?;

    let mut injected = 0usize;
    for (name, source) in EVASION_SCRIPTS {
        let result = page
            .execute(
                cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams {
                    source: (*source).to_string(),
                    include_command_line_api: None,
                    world_name: None,
                    run_immediately: None,
                },
            )
            .await;
        match result {
            Ok(_) => {
                debug!("injected evasion: {name}");
                injected += 1;
            }
            Err(e) => warn!("failed to inject {name}: {e}"),
        }
    }
    if injected == 0 {
        return Err(anyhow::anyhow!(
            "failed to inject any of {} stealth scripts",
            EVASION_SCRIPTS.len()
        ));
    }

    page.execute(
        cdp::browser_protocol::network::SetUserAgentOverrideParams {
            user_agent: user_agent.to_string(),
            accept_language: Some("en-US,en;q=0.9".to_string()),
            platform: Some(platform_for(user_agent).to_string()),
            user_agent_metadata: None,
        },
    )
    .await
    .context("overriding user agent")?;

    debug!(
        "stealth prepared: {injected}/{} scripts active",
        EVASION_SCRIPTS.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_tracks_user_agent() {
        assert_eq!(platform_for("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"), "Win32");
        assert_eq!(
            platform_for("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)"),
            "MacIntel"
        );
        assert_eq!(platform_for("Mozilla/5.0 (X11; Linux x86_64)"), "Linux x86_64");
    }

    #[test]
    fn evasion_scripts_are_nonempty() {
        for (name, source) in EVASION_SCRIPTS {
            assert!(!source.trim().is_empty(), "{name} is empty");
        }
    }
}
