#![allow(dead_code)]

use std::time::Duration;

use parley_core::{ChatView, Config};
use tokio::sync::watch;

/// Fast timings so the tests finish in well under a second
pub fn fast_config(ws_url: &str) -> Config {
    let mut config = Config::new();
    config.connection.url = ws_url.to_string();
    config.connection.base_delay_ms = 50;
    config.connection.max_delay_ms = 200;
    config.connection.send_retry_delay_ms = 50;
    config.pacing.placeholder = false;
    config.pacing.pause_ms = 20;
    config.pacing.pause_jitter_ms = 0;
    config.pacing.min_pause_ms = 10;
    config.pacing.max_pause_ms = 50;
    config.pacing.sentence_pause_ms = 0;
    config.pacing.grace_ms = 20;
    config.pacing.idle_timeout_ms = 2000;
    config.welcome_message = None;
    config
}

/// Wait until the published view satisfies `pred`
pub async fn wait_for<F>(view: &mut watch::Receiver<ChatView>, pred: F) -> ChatView
where
    F: Fn(&ChatView) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = view.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            view.changed().await.expect("controller stopped");
        }
    })
    .await
    .expect("timed out waiting for view")
}

pub fn assistant_messages(view: &ChatView) -> Vec<String> {
    view.messages
        .iter()
        .filter(|m| m.role == parley_core::Role::Assistant)
        .map(|m| m.content.clone())
        .collect()
}
