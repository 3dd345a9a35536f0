use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use locus::{Fallback, Input, Provider, ProviderError, Value, provider_fn};
use serde_json::json;

/// Failure injection for the stub providers.
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    pub fail: Vec<String>,
    pub flaky: Vec<String>,
    pub slow: Vec<String>,
}

pub fn provider(id: &'static str, behaviour: &Behaviour) -> Arc<dyn Provider> {
    let fail = behaviour.fail.iter().any(|name| name == id);
    let flaky = behaviour.flaky.iter().any(|name| name == id);
    let slow = behaviour.slow.iter().any(|name| name == id);
    let attempts = Arc::new(AtomicUsize::new(0));

    let primary = provider_fn(move |input, cancel| {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;

        async move {
            if slow {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                }
            }

            if fail {
                return Err(ProviderError::fatal(anyhow::anyhow!("{id} service is unavailable")));
            }

            if flaky && attempt == 1 {
                return Err(ProviderError::transient(anyhow::anyhow!("{id} service timed out")));
            }

            answer(id, &input)
        }
    });

    // search results double as a second source for the explorer
    if id == "explorer" {
        return Fallback::new(primary)
            .or(provider_fn(|input, _| async move {
                let place = input.param_str("location").unwrap_or("the city");
                Ok(json!(format!("Web results for things to do in {place}")))
            }))
            .finish();
    }

    primary
}

fn answer(id: &str, input: &Input) -> Result<Value, ProviderError> {
    let place = input.param_str("location").unwrap_or("the city");

    let value = match id {
        "weather" => json!({ "location": place, "sky": "light rain", "temp": 19 }),
        "navigator" => json!({ "to": place, "flights": ["KQ 101", "ET 308"], "local": "matatu" }),
        "env_hazards" => json!({ "aqi": 42, "alerts": [] }),
        "budget" => json!({ "rate": 129.4, "from": "USD", "to": "KES" }),
        "culture_food" => json!(format!("In {place}, try nyama choma and chapati")),
        "language" => json!({ "hello": "Jambo", "thank you": "Asante" }),
        "safety" => json!(format!("No active advisories for {place}")),
        "explorer" => {
            let rainy = input
                .upstream("weather")
                .and_then(|w| w["sky"].as_str())
                .is_some_and(|sky| sky.contains("rain"));
            if rainy {
                json!("Museums and covered markets")
            } else {
                json!("Hiking and open air markets")
            }
        }
        "wardrobe" => {
            let event = input.param_str("event").unwrap_or("day out");
            let temp = input
                .upstream("weather")
                .and_then(|w| w["temp"].as_i64())
                .unwrap_or(20);
            let layer = if temp < 20 { "a light jacket" } else { "a linen shirt" };
            json!(format!("For {event}: {layer} and an umbrella"))
        }
        "memory" => json!({ "saved": input.param_str("memory") }),
        "search" => json!([format!("{place} travel guide")]),
        other => return Err(ProviderError::fatal(anyhow::anyhow!("no stub for {other}"))),
    };

    Ok(value)
}
