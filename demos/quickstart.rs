use anyhow::Result;
use errand::adapters::{ConsoleInteraction, LogProgress};
use errand::llm::{LlmClient, LlmConfig, LlmExtractor, LlmInterpreter, LlmPlanner, LlmReplanner, LlmVerifier};
use errand::{
    Browser, BrowserConfig, BrowserDriver, ExecuteOptions, PagePerceiver, PageView, Planner,
    Sequencer, SequencerConfig,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let prompt = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let prompt = if prompt.trim().is_empty() {
        "What is the latest stable Rust release?".to_string()
    } else {
        prompt
    };

    let browser = if let Ok(ws) = std::env::var("CHROME_WS_URL") {
        if !ws.trim().is_empty() {
            Browser::connect(&ws).await?
        } else {
            Browser::launch(BrowserConfig { headless: false, user_agent: None }).await?
        }
    } else {
        Browser::launch(BrowserConfig { headless: false, user_agent: None }).await?
    };
    let browser = Arc::new(browser);

    let client = LlmClient::new(LlmConfig::default())?;
    let perceiver = Arc::new(PageView::new(browser.clone()));
    let cancel = CancellationToken::new();

    let snapshot = perceiver.markup().await;
    let planner = LlmPlanner::new(client.clone());
    let actions = planner
        .plan(&prompt, Some(&snapshot).filter(|s| !s.is_empty()).map(|s| s.as_str()), &cancel)
        .await?;

    let sequencer = Sequencer::new(
        perceiver,
        Arc::new(BrowserDriver::new(browser)),
        Arc::new(LlmInterpreter::new(client.clone())),
        Arc::new(LlmVerifier::new(client.clone())),
        SequencerConfig::default(),
    )
    .with_replanner(Arc::new(LlmReplanner::new(client.clone())))
    .with_extractor(Arc::new(LlmExtractor::new(client)))
    .with_interaction(Arc::new(ConsoleInteraction))
    .with_progress(Arc::new(LogProgress));

    let summary = sequencer
        .execute(actions, &prompt, ExecuteOptions::default(), cancel)
        .await;

    println!("\n{}", summary.message);
    if let Some(steps) = &summary.next_steps {
        println!("\nYou could try:");
        for step in steps {
            println!("  - {step}");
        }
    }
    Ok(())
}
