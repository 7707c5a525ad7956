use std::time::Duration;

use console::style;

use crate::task::InstanceId;

/// Per-node result of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All declared artifacts were already in the store; nothing ran.
    AlreadyComplete,
    /// The run procedure executed and produced every declared output.
    Executed,
    /// The run procedure raised, panicked, or left outputs missing.
    Failed,
    /// Never started because an upstream node failed in this pass.
    Skipped,
}

/// One entry of a [`RunRecord`].
#[derive(Debug)]
pub struct NodeReport {
    pub id: InstanceId,
    pub outcome: Outcome,
    pub duration: Duration,
    /// Failure cause, present iff `outcome` is [`Outcome::Failed`].
    pub error: Option<anyhow::Error>,
}

/// Ephemeral summary of one scheduling pass.
///
/// Entries appear in completion order: topological for the sequential
/// executor, completion order of the worker pool for the parallel one.
#[derive(Debug, Default)]
pub struct RunRecord {
    pub entries: Vec<NodeReport>,
}

impl RunRecord {
    pub(crate) fn push(&mut self, id: InstanceId, outcome: Outcome, duration: Duration) {
        self.entries.push(NodeReport {
            id,
            outcome,
            duration,
            error: None,
        });
    }

    pub(crate) fn push_failed(&mut self, id: InstanceId, duration: Duration, error: anyhow::Error) {
        self.entries.push(NodeReport {
            id,
            outcome: Outcome::Failed,
            duration,
            error: Some(error),
        });
    }

    pub fn outcome_of(&self, id: &InstanceId) -> Option<Outcome> {
        self.entries
            .iter()
            .find(|report| report.id == *id)
            .map(|report| report.outcome)
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.entries
            .iter()
            .filter(|report| report.outcome == outcome)
            .count()
    }

    pub fn executed(&self) -> usize {
        self.count(Outcome::Executed)
    }

    pub fn already_complete(&self) -> usize {
        self.count(Outcome::AlreadyComplete)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    /// True when nothing failed and nothing was left behind.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    /// Renders a human-readable summary, one line per node plus totals and
    /// failure details.
    pub fn render_summary(&self) -> String {
        use std::fmt::Write;

        let mut acc = String::new();

        for report in &self.entries {
            let marker = match report.outcome {
                Outcome::AlreadyComplete => style("cached").cyan(),
                Outcome::Executed => style("ran").green(),
                Outcome::Failed => style("failed").red(),
                Outcome::Skipped => style("skipped").yellow(),
            };
            writeln!(acc, "{:>8}  {}", marker, report.id).unwrap();
        }

        writeln!(
            acc,
            "{} ran, {} cached, {} failed, {} skipped",
            self.executed(),
            self.already_complete(),
            self.failed(),
            self.skipped(),
        )
        .unwrap();

        for report in &self.entries {
            if let Some(error) = &report.error {
                writeln!(acc, "{} {}:\n  {:#}", style("✗").red(), report.id, error).unwrap();
            }
        }

        acc
    }

    /// Machine-readable form of the record.
    pub fn to_json(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|report| {
                serde_json::json!({
                    "task": report.id.task(),
                    "instance": report.id.to_string(),
                    "outcome": match report.outcome {
                        Outcome::AlreadyComplete => "already_complete",
                        Outcome::Executed => "executed",
                        Outcome::Failed => "failed",
                        Outcome::Skipped => "skipped",
                    },
                    "duration_us": report.duration.as_micros() as u64,
                    "error": report.error.as_ref().map(|error| format!("{error:#}")),
                })
            })
            .collect();

        serde_json::json!({
            "entries": entries,
            "executed": self.executed(),
            "already_complete": self.already_complete(),
            "failed": self.failed(),
            "skipped": self.skipped(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::param::Params;
    use crate::task::{TaskInstance, TaskSpec};

    fn id(name: &str) -> InstanceId {
        let spec = TaskSpec::define(name).run(|_| Ok(()));
        TaskInstance::new(spec, Params::new()).id().clone()
    }

    #[test]
    fn test_counts_and_success() {
        let mut record = RunRecord::default();
        record.push(id("a"), Outcome::Executed, Duration::ZERO);
        record.push(id("b"), Outcome::AlreadyComplete, Duration::ZERO);

        assert_eq!(record.executed(), 1);
        assert_eq!(record.already_complete(), 1);
        assert!(record.is_success());

        record.push_failed(id("c"), Duration::ZERO, anyhow::anyhow!("boom"));
        record.push(id("d"), Outcome::Skipped, Duration::ZERO);

        assert!(!record.is_success());
        assert_eq!(record.to_json()["failed"], 1);
    }
}
