use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::dom::Dom;
use crate::inspect::is_visible;

/// Third-party verification services the engine can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeProvider {
    Recaptcha,
    Hcaptcha,
    Turnstile,
    Arkose,
    DataDome,
    PerimeterX,
    Unknown,
}

impl fmt::Display for ChallengeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChallengeProvider::Recaptcha => "reCAPTCHA",
            ChallengeProvider::Hcaptcha => "hCaptcha",
            ChallengeProvider::Turnstile => "Cloudflare Turnstile",
            ChallengeProvider::Arkose => "Arkose Labs",
            ChallengeProvider::DataDome => "DataDome",
            ChallengeProvider::PerimeterX => "PerimeterX",
            ChallengeProvider::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A verification widget visible on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeInfo {
    pub provider: ChallengeProvider,
    /// Selector that matched.
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_key: Option<String>,
}

/// Widget selectors, checked in order.
pub const CHALLENGE_SELECTORS: &[(&str, ChallengeProvider)] = &[
    (
        "iframe[src*=\"recaptcha\"]:not([src*=\"size=invisible\"])",
        ChallengeProvider::Recaptcha,
    ),
    (".g-recaptcha", ChallengeProvider::Recaptcha),
    ("iframe[src*=\"hcaptcha.com\"]", ChallengeProvider::Hcaptcha),
    (".h-captcha", ChallengeProvider::Hcaptcha),
    (
        "iframe[src*=\"challenges.cloudflare.com\"]",
        ChallengeProvider::Turnstile,
    ),
    (".cf-turnstile", ChallengeProvider::Turnstile),
    ("iframe[src*=\"arkoselabs\"]", ChallengeProvider::Arkose),
    ("iframe[src*=\"funcaptcha\"]", ChallengeProvider::Arkose),
    ("#FunCaptcha", ChallengeProvider::Arkose),
    (
        "iframe[src*=\"captcha-delivery.com\"]",
        ChallengeProvider::DataDome,
    ),
    ("#px-captcha", ChallengeProvider::PerimeterX),
    ("iframe[title*=\"captcha\" i]", ChallengeProvider::Unknown),
];

/// First visible verification widget, if any.
pub async fn detect_challenge<D: Dom + ?Sized>(dom: &D) -> Option<ChallengeInfo> {
    for (selector, provider) in CHALLENGE_SELECTORS {
        let Ok(nodes) = dom.query_all(None, selector).await else {
            continue;
        };
        for node in nodes {
            let Ok(el) = dom.describe(node).await else {
                continue;
            };
            if !is_visible(&el) {
                continue;
            }
            let site_key = el.attr("data-sitekey").map(str::to_string);
            debug!(%provider, selector, "challenge detected");
            return Some(ChallengeInfo {
                provider: *provider,
                selector: selector.to_string(),
                site_key,
            });
        }
    }
    None
}

/// Poll once per second until no challenge is visible. Returns false if one
/// is still showing when `timeout` elapses.
pub async fn wait_for_challenge<D: Dom + ?Sized>(dom: &D, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let Some(challenge) = detect_challenge(dom).await else {
            return true;
        };
        if Instant::now() >= deadline {
            info!(provider = %challenge.provider, "challenge still present after {:?}", timeout);
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1).min(deadline - Instant::now())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fake::FakeDom;

    #[tokio::test]
    async fn classifies_providers() {
        let cases = [
            ("https://www.google.com/recaptcha/api2/anchor?k=abc", ChallengeProvider::Recaptcha),
            ("https://newassets.hcaptcha.com/captcha/v1/x", ChallengeProvider::Hcaptcha),
            ("https://challenges.cloudflare.com/cdn-cgi/x", ChallengeProvider::Turnstile),
            ("https://client-api.arkoselabs.com/fc/gc", ChallengeProvider::Arkose),
            ("https://geo.captcha-delivery.com/captcha/", ChallengeProvider::DataDome),
        ];
        for (src, provider) in cases {
            let dom = FakeDom::new("https://shop.test");
            dom.add(None, "iframe", &[("src", src)]);
            let found = detect_challenge(&dom).await.unwrap();
            assert_eq!(found.provider, provider, "{src}");
        }
    }

    #[tokio::test]
    async fn reads_site_key_and_ignores_invisible_widgets() {
        let dom = FakeDom::new("https://shop.test");
        let badge = dom.add(
            None,
            "iframe",
            &[("src", "https://www.google.com/recaptcha/api2/anchor?size=invisible")],
        );
        assert!(detect_challenge(&dom).await.is_none());

        let widget = dom.add(None, "div", &[("class", "h-captcha"), ("data-sitekey", "10000000-ffff")]);
        let found = detect_challenge(&dom).await.unwrap();
        assert_eq!(found.provider, ChallengeProvider::Hcaptcha);
        assert_eq!(found.site_key.as_deref(), Some("10000000-ffff"));

        dom.hide(widget);
        dom.hide(badge);
        assert!(detect_challenge(&dom).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_cleared() {
        let dom = FakeDom::new("https://shop.test");
        let px = dom.add(None, "div", &[("id", "px-captcha")]);
        assert!(!wait_for_challenge(&dom, Duration::from_secs(3)).await);

        dom.hide(px);
        let start = Instant::now();
        assert!(wait_for_challenge(&dom, Duration::from_secs(3)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_on_schedule() {
        let dom = FakeDom::new("https://shop.test");
        dom.add(None, "div", &[("class", "cf-turnstile")]);
        let start = Instant::now();
        assert!(!wait_for_challenge(&dom, Duration::from_millis(2500)).await);
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }
}
