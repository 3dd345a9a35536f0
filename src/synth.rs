use std::fmt::Write;

use async_trait::async_trait;

use crate::core::{Request, Value};
use crate::report::{Outcome, Report};

/// Turns a report into the final answer for the user.
///
/// The engine only hands over the report, how it gets phrased is entirely up
/// to the implementation.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, request: &Request, report: &Report) -> anyhow::Result<String>;
}

/// Renders one section per capability.
#[derive(Debug, Clone, Default)]
pub struct PlainText;

#[async_trait]
impl Synthesizer for PlainText {
    async fn synthesize(&self, request: &Request, report: &Report) -> anyhow::Result<String> {
        let mut out = String::new();

        if let Some(location) = request.params().get("location").and_then(Value::as_str) {
            writeln!(out, "Trip to {location}")?;
            writeln!(out)?;
        }

        for entry in &report.entries {
            writeln!(out, "## {}", entry.capability)?;

            match &entry.outcome {
                Outcome::Succeeded(value) => writeln!(out, "{}", render(value))?,
                Outcome::Failed(err) => writeln!(out, "Could not be obtained: {err}")?,
                Outcome::Skipped(reason) => writeln!(out, "Not attempted: {reason}")?,
            }

            writeln!(out)?;
        }

        Ok(out.trim_end().to_string())
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::from("(no data)"),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SkipReason;
    use crate::error::NodeError;
    use crate::report::Entry;
    use serde_json::json;

    #[tokio::test]
    async fn test_plain_text_sections() {
        let report = Report {
            entries: vec![
                Entry {
                    capability: "weather".into(),
                    outcome: Outcome::Failed(NodeError::Provider("no station".into())),
                },
                Entry {
                    capability: "wardrobe".into(),
                    outcome: Outcome::Skipped(SkipReason::Dependency {
                        upstream: "weather".into(),
                    }),
                },
                Entry {
                    capability: "language".into(),
                    outcome: Outcome::Succeeded(json!("Jambo means hello")),
                },
            ],
        };

        let request = Request::new(["wardrobe", "language"]).param("location", "Mombasa");
        let text = PlainText.synthesize(&request, &report).await.unwrap();

        assert_eq!(
            text,
            "Trip to Mombasa\n\n\
             ## weather\nCould not be obtained: Provider error: no station\n\n\
             ## wardrobe\nNot attempted: prerequisite 'weather' failed\n\n\
             ## language\nJambo means hello"
        );
    }
}
