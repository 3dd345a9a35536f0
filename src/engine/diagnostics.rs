use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::CapabilityId;
use crate::engine::node::State;
use crate::plan::Plan;

/// Timing of one dispatched node.
#[derive(Debug, Clone, Copy)]
pub struct Execution {
    pub start: Instant,
    /// Wall time across all attempts, backoff included.
    pub duration: Duration,
    pub attempts: u32,
}

/// Execution metrics of a plan run.
///
/// Only nodes that were actually dispatched and reported back appear here.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub executions: HashMap<CapabilityId, Execution>,
}

impl Diagnostics {
    /// Renders the plan as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Grey**: Never ran
    pub fn render_mermaid(&self, plan: &Plan) -> String {
        let mut buf = String::new();
        _ = self.write_mermaid(&mut buf, plan);
        buf
    }

    fn write_mermaid(&self, buf: &mut String, plan: &Plan) -> std::fmt::Result {
        writeln!(buf, "graph LR")?;

        let (min_time, max_time) = self.bounds();

        for index in plan.graph.node_indices() {
            let node = &plan.graph[index];
            let name = node.id().replace('"', "\\\"");

            let (label, color) = match self.executions.get(node.id()) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    let label = format!("{:.2?}, {}", exec.duration, node.state().name());
                    (label, gradient(t))
                }
                None => (node.state().name().to_string(), "#D3D3D3".to_string()),
            };

            writeln!(buf, "    {}[\"{}\\n{}\"]", index.index(), name, label)?;
            writeln!(buf, "    style {} fill:{}", index.index(), color)?;

            if let State::Failed(_) = node.state() {
                writeln!(buf, "    style {} stroke:#FF0000,stroke-width:3px", index.index())?;
            }
        }

        for edge in plan.graph.raw_edges() {
            writeln!(buf, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }

    fn bounds(&self) -> (f64, f64) {
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for exec in self.executions.values() {
            let secs = exec.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        // all nodes took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        (min_time, max_time)
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{:02X}{:02X}{:02X}", r, g, b)
}
