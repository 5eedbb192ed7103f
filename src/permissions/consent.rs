//! Interactive consent collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use super::{OperationKind, RiskTier};

/// What the user can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentChoice {
    AllowOnce,
    AllowSession,
    AlwaysAllow,
    Deny,
    AlwaysDeny,
}

impl ConsentChoice {
    /// Parses a terminal answer: a menu number or its initial letter.
    pub fn parse(answer: &str) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "1" | "o" | "once" | "y" | "yes" => Some(ConsentChoice::AllowOnce),
            "2" | "s" | "session" => Some(ConsentChoice::AllowSession),
            "3" | "a" | "always" => Some(ConsentChoice::AlwaysAllow),
            "4" | "d" | "n" | "no" | "deny" => Some(ConsentChoice::Deny),
            "5" | "never" => Some(ConsentChoice::AlwaysDeny),
            _ => None,
        }
    }
}

/// A prompt shown to the consent provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub request_id: String,
    pub operation: OperationKind,
    pub risk_tier: RiskTier,
    /// Human-readable description of the exact action.
    pub description: String,
}

/// No one is available to answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("consent unavailable: {0}")]
pub struct ConsentUnavailable(pub String);

/// Asks a human (or a policy standing in for one) to approve an operation.
#[async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn request(&self, request: &ConsentRequest) -> Result<ConsentChoice, ConsentUnavailable>;
}

/// Used by the HTTP server: there is never anyone to ask.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractiveConsent;

#[async_trait]
impl ConsentProvider for NonInteractiveConsent {
    async fn request(&self, _request: &ConsentRequest) -> Result<ConsentChoice, ConsentUnavailable> {
        Err(ConsentUnavailable("running non-interactively".to_string()))
    }
}

/// Prompts on stderr and reads the answer from stdin.
///
/// Prompts are serialized so concurrent requests never interleave.
#[derive(Debug, Default)]
pub struct TerminalConsent {
    stdin: Mutex<Option<Lines<BufReader<Stdin>>>>,
}

impl TerminalConsent {
    pub fn new() -> Self {
        Self::default()
    }

    fn render(request: &ConsentRequest) -> String {
        format!(
            "\n[permission] {} risk: {}\n  {}\n  1) allow once  2) allow for session  3) always allow  4) deny  5) always deny\n> ",
            request.risk_tier, request.operation, request.description
        )
    }
}

#[async_trait]
impl ConsentProvider for TerminalConsent {
    async fn request(&self, request: &ConsentRequest) -> Result<ConsentChoice, ConsentUnavailable> {
        let mut stdin = self.stdin.lock().await;
        let lines = stdin.get_or_insert_with(|| BufReader::new(tokio::io::stdin()).lines());
        let mut stderr = tokio::io::stderr();

        loop {
            stderr
                .write_all(Self::render(request).as_bytes())
                .await
                .map_err(|e| ConsentUnavailable(e.to_string()))?;
            stderr
                .flush()
                .await
                .map_err(|e| ConsentUnavailable(e.to_string()))?;

            match lines.next_line().await {
                Ok(Some(answer)) => {
                    if let Some(choice) = ConsentChoice::parse(&answer) {
                        return Ok(choice);
                    }
                }
                Ok(None) => return Err(ConsentUnavailable("stdin closed".to_string())),
                Err(e) => return Err(ConsentUnavailable(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_parse_by_number_and_letter() {
        assert_eq!(ConsentChoice::parse("1"), Some(ConsentChoice::AllowOnce));
        assert_eq!(ConsentChoice::parse(" S \n"), Some(ConsentChoice::AllowSession));
        assert_eq!(ConsentChoice::parse("always"), Some(ConsentChoice::AlwaysAllow));
        assert_eq!(ConsentChoice::parse("n"), Some(ConsentChoice::Deny));
        assert_eq!(ConsentChoice::parse("5"), Some(ConsentChoice::AlwaysDeny));
        assert_eq!(ConsentChoice::parse("maybe"), None);
    }

    #[tokio::test]
    async fn non_interactive_consent_is_unavailable() {
        let request = ConsentRequest {
            request_id: "r".to_string(),
            operation: OperationKind::BashExec,
            risk_tier: RiskTier::High,
            description: "run `ls`".to_string(),
        };
        assert!(NonInteractiveConsent.request(&request).await.is_err());
    }

    #[test]
    fn prompt_lists_every_option() {
        let prompt = TerminalConsent::render(&ConsentRequest {
            request_id: "r".to_string(),
            operation: OperationKind::GitPush,
            risk_tier: RiskTier::High,
            description: "push branch tb/1".to_string(),
        });
        assert!(prompt.contains("git_push"));
        assert!(prompt.contains("always deny"));
        assert!(prompt.contains("push branch tb/1"));
    }
}
