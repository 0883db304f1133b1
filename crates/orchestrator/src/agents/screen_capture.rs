use async_trait::async_trait;
use deskmate_core::{Agent, AgentContext, AgentOutput, Result, ScreenCapturer};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use super::action;

/// Hides the assistant's windows, captures the screen and runs OCR, then
/// restores the windows whether or not the capture worked.
pub struct ScreenCaptureAgent {
    capturer: Arc<dyn ScreenCapturer>,
}

impl ScreenCaptureAgent {
    pub fn new(capturer: Arc<dyn ScreenCapturer>) -> Self {
        Self { capturer }
    }
}

#[async_trait]
impl Agent for ScreenCaptureAgent {
    fn name(&self) -> &str {
        "screen_capture"
    }

    fn description(&self) -> &str {
        "Captures the screen and extracts text"
    }

    async fn execute(&self, params: Value, ctx: AgentContext) -> Result<AgentOutput> {
        if !matches!(action(&params), "capture_and_extract" | "capture" | "execute") {
            return Ok(AgentOutput::failure(format!(
                "screen_capture: unsupported action '{}'",
                action(&params)
            )));
        }
        let options = params.get("options").cloned().unwrap_or_else(|| json!({}));

        if let Some(host) = &ctx.host {
            if let Err(e) = host.hide_all_windows().await {
                warn!(error = %e, "Could not hide windows before capture");
            }
        }
        let captured = self.capturer.capture_and_extract(options).await;
        if let Some(host) = &ctx.host {
            if let Err(e) = host.show_all_windows(json!({"reason": "screen_capture"})).await {
                warn!(error = %e, "Could not restore windows after capture");
            }
        }

        match captured {
            Ok(result) => Ok(AgentOutput::ok(result)),
            Err(e) => Ok(AgentOutput::failure(format!("Screen capture failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskmate_core::{Error, HostControls};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Windows(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl HostControls for Windows {
        async fn hide_all_windows(&self) -> Result<()> {
            self.0.lock().unwrap().push("hide");
            Ok(())
        }

        async fn show_all_windows(&self, _info: Value) -> Result<()> {
            self.0.lock().unwrap().push("show");
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl ScreenCapturer for Broken {
        async fn capture_and_extract(&self, _options: Value) -> Result<Value> {
            Err(Error::Other("no display".into()))
        }
    }

    #[tokio::test]
    async fn test_windows_restored_after_failed_capture() {
        let windows = Arc::new(Windows::default());
        let mut ctx = AgentContext::new();
        ctx.host = Some(windows.clone() as Arc<dyn HostControls>);

        let out = ScreenCaptureAgent::new(Arc::new(Broken))
            .execute(json!({"action": "capture_and_extract"}), ctx)
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.error.unwrap().contains("no display"));
        assert_eq!(*windows.0.lock().unwrap(), vec!["hide", "show"]);
    }
}
