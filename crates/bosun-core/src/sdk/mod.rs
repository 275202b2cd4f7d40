//! Collaborator traits for agent SDKs and notifications.
//!
//! The core never speaks an LLM protocol itself: it hands a prompt to an
//! [`AgentSdkClient`] and gets back final text plus token usage. The
//! pooled path ([`SdkPool`]) exists so a busy adapter can delegate work
//! instead of blocking the caller.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

/// A request handed to an agent SDK.
#[derive(Debug, Clone)]
pub struct SdkRequest {
    /// SDK adapter slug (`codex`, `copilot`, `claude`, `gemini`,
    /// `opencode`).
    pub sdk: String,
    /// Model token for the adapter, when the profile specifies one.
    pub variant: Option<String>,
    pub prompt: String,
    /// Directory the agent works in (the attempt worktree).
    pub working_dir: Option<PathBuf>,
    /// Extra environment for hook bridges (`BOSUN_TASK_ID`, ...).
    pub env: HashMap<String, String>,
}

/// What comes back from an agent SDK: final text plus token usage.
/// Formats beyond this are deliberately not unified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdkCompletion {
    pub final_text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Opaque request/response interface to one agent SDK.
#[async_trait]
pub trait AgentSdkClient: Send + Sync {
    /// The adapter slug this client serves.
    fn sdk(&self) -> &str;

    /// Execute a prompt to completion.
    async fn execute(&self, request: &SdkRequest) -> Result<SdkCompletion>;
}

/// Pooled execution path used when an adapter already has an active
/// session: the pool runs the prompt on a worker instead of contending.
#[async_trait]
pub trait SdkPool: Send + Sync {
    async fn exec_pooled(&self, prompt: &str, sdk: &str) -> Result<SdkCompletion>;
}

/// Outbound user-facing notifications (Telegram, WhatsApp, ... live
/// behind this in the host application).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

// Compile-time assertions: all three must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentSdkClient, _: &dyn SdkPool, _: &dyn Notifier) {}
};

/// A notifier that drops everything; useful as a default and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _subject: &str, _body: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;

    #[async_trait]
    impl AgentSdkClient for EchoClient {
        fn sdk(&self) -> &str {
            "codex"
        }

        async fn execute(&self, request: &SdkRequest) -> Result<SdkCompletion> {
            Ok(SdkCompletion {
                final_text: request.prompt.clone(),
                input_tokens: request.prompt.len() as u64,
                output_tokens: 0,
            })
        }
    }

    #[tokio::test]
    async fn clients_are_usable_as_trait_objects() {
        let client: Box<dyn AgentSdkClient> = Box::new(EchoClient);
        let completion = client
            .execute(&SdkRequest {
                sdk: "codex".into(),
                variant: None,
                prompt: "hello".into(),
                working_dir: None,
                env: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(completion.final_text, "hello");
        assert_eq!(completion.input_tokens, 5);
    }

    #[tokio::test]
    async fn noop_notifier_accepts_everything() {
        let notifier: Box<dyn Notifier> = Box::new(NoopNotifier);
        notifier.notify("subject", "body").await.unwrap();
    }
}
