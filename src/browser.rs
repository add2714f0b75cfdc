use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;

use crate::adapters::{PageDriver, PagePerceiver};
use crate::plan::{Operation, Outcome};

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
        }
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

pub struct Browser {
    page: Page,
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Use a unique user data dir per run to avoid ProcessSingleton profile lock conflicts
        // observed when Chromium is restarted rapidly or multiple instances are spawned.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("errand-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        // Ensure a non-zero viewport so layout-dependent JS behaves.
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(1280)
                    .height(800)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .unwrap(),
            )
            .await;
        Ok(Self {
            page,
            _browser: browser,
        })
    }

    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        Ok(Self {
            page,
            _browser: browser,
        })
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, js: String) -> Result<T> {
        let result = self.page.evaluate(js).await?;
        result.into_value::<T>().map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub async fn markup(&self) -> Result<String> {
        self.eval("document.documentElement.outerHTML".to_string())
            .await
    }

    /// Click the first element matching the selector. False when nothing matched.
    pub async fn click_selector(&self, selector: &str) -> Result<bool> {
        let js = format!(
            r#"(() => {{
              const el = document.querySelector({sel});
              if (!el) return false;
              el.scrollIntoView({{block: "center"}});
              el.click();
              return true;
            }})()"#,
            sel = js_string(selector)
        );
        self.eval(js).await
    }

    /// Set an input's value the way a user would, so framework listeners fire.
    pub async fn fill_selector(&self, selector: &str, value: &str) -> Result<bool> {
        let js = format!(
            r#"(() => {{
              const el = document.querySelector({sel});
              if (!el) return false;
              el.focus();
              const proto = el.tagName === "TEXTAREA"
                ? window.HTMLTextAreaElement.prototype
                : window.HTMLInputElement.prototype;
              const desc = Object.getOwnPropertyDescriptor(proto, "value");
              if (desc && desc.set) {{ desc.set.call(el, {val}); }} else {{ el.value = {val}; }}
              el.dispatchEvent(new Event("input", {{bubbles: true}}));
              el.dispatchEvent(new Event("change", {{bubbles: true}}));
              return true;
            }})()"#,
            sel = js_string(selector),
            val = js_string(value)
        );
        self.eval(js).await
    }

    pub async fn press(&self, key: &str) -> Result<()> {
        let k = js_string(key);
        let js = format!(
            r#"(() => {{
              const el = document.activeElement || document.body;
              const opts = {{key: {k}, code: {k}, bubbles: true}};
              el.dispatchEvent(new KeyboardEvent("keydown", opts));
              el.dispatchEvent(new KeyboardEvent("keyup", opts));
              if ({k} === "Enter" && el.form) {{ el.form.requestSubmit(); }}
            }})()"#
        );
        let eval = EvaluateParams::builder()
            .expression(js)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    pub async fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        let script = format!("window.scrollBy({dx}, {dy});");
        let eval = EvaluateParams::builder()
            .expression(script)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    /// Visible text of the matching element, or the whole body.
    pub async fn text(&self, selector: Option<&str>) -> Result<String> {
        let js = match selector {
            Some(sel) => format!(
                r#"(() => {{
                  const el = document.querySelector({sel});
                  return el ? el.innerText : "";
                }})()"#,
                sel = js_string(sel)
            ),
            None => "document.body ? document.body.innerText : \"\"".to_string(),
        };
        self.eval(js).await
    }

    pub async fn wait_for_stable(&self) -> Result<()> {
        sleep(Duration::from_millis(400)).await;
        Ok(())
    }
}

// ========================= Sequencer Seams =========================

/// Markup snapshots for the sequencer. Read failures surface as an empty
/// snapshot, never as an error.
pub struct PageView {
    browser: Arc<Browser>,
}

impl PageView {
    pub fn new(browser: Arc<Browser>) -> Self {
        Self { browser }
    }
}

#[async_trait]
impl PagePerceiver for PageView {
    async fn markup(&self) -> String {
        self.browser.markup().await.unwrap_or_default()
    }

    async fn current_url(&self) -> Option<String> {
        self.browser.url().await.ok().filter(|u| !u.is_empty())
    }
}

/// Performs concrete operations against the live page.
pub struct BrowserDriver {
    browser: Arc<Browser>,
}

impl BrowserDriver {
    pub fn new(browser: Arc<Browser>) -> Self {
        Self { browser }
    }
}

// Observations flow into summaries verbatim; keep them readable.
const EXTRACT_CAP: usize = 4000;

#[async_trait]
impl PageDriver for BrowserDriver {
    async fn run(&self, operation: &Operation) -> Outcome {
        match operation {
            Operation::Navigate { url } => match self.browser.goto(url).await {
                Ok(()) => {
                    let _ = self.browser.wait_for_stable().await;
                    Outcome::ok(format!("navigated to {url}"))
                }
                Err(e) => Outcome::fail(format!("navigation to {url} failed: {e}")),
            },
            Operation::Click { selector } => match self.browser.click_selector(selector).await {
                Ok(true) => Outcome::ok(format!("clicked {selector}")),
                Ok(false) => Outcome::fail(format!("no element matched selector {selector}")),
                Err(e) => Outcome::fail(e.to_string()),
            },
            Operation::Fill { selector, value } => {
                match self.browser.fill_selector(selector, value).await {
                    Ok(true) => Outcome::ok(format!("filled {selector}")),
                    Ok(false) => Outcome::fail(format!("no element matched selector {selector}")),
                    Err(e) => Outcome::fail(e.to_string()),
                }
            }
            Operation::Press { key } => match self.browser.press(key).await {
                Ok(()) => Outcome::ok(format!("pressed {key}")),
                Err(e) => Outcome::fail(e.to_string()),
            },
            Operation::Scroll { dx, dy } => match self.browser.scroll(*dx, *dy).await {
                Ok(()) => Outcome::ok(format!("scrolled by ({dx}, {dy})")),
                Err(e) => Outcome::fail(e.to_string()),
            },
            Operation::Wait { ms } => {
                sleep(Duration::from_millis(*ms)).await;
                Outcome::ok(format!("waited {ms}ms"))
            }
            Operation::Extract { selector } => match self.browser.text(selector.as_deref()).await {
                Ok(text) => Outcome::ok(text.chars().take(EXTRACT_CAP).collect::<String>()),
                Err(e) => Outcome::fail(e.to_string()),
            },
        }
    }
}
