//! Human-readable progress lines and run summaries

use std::fmt::Write as _;

use kubestrap_core::{
    HostStatus, RunEvent, RunOutcome, RunReport, StageReport, StageStatus, StepOutcome,
};

/// One progress line per event, or nothing for events not worth a line
#[must_use]
pub fn event_line(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::StageStarted { stage, hosts } => {
            Some(format!("==> {stage} [{}]", hosts.join(", ")))
        }
        RunEvent::StepFinished {
            host,
            step,
            outcome,
            message,
            ..
        } => {
            let line = format!("    {host}: {step} ... {outcome}");
            match (outcome, message) {
                (StepOutcome::Failed, Some(message)) => Some(format!("{line} ({message})")),
                _ => Some(line),
            }
        }
        RunEvent::HandlerFinished {
            host,
            handler,
            outcome,
            ..
        } => Some(format!("    {host}: handler {handler} ... {outcome}")),
        RunEvent::HostFinished {
            host,
            status: HostStatus::Cancelled,
            ..
        } => Some(format!("    {host}: cancelled")),
        RunEvent::HostFinished { .. } => None,
        RunEvent::StageFinished {
            stage,
            status: StageStatus::NoHosts,
        } => Some(format!("==> {stage}: no hosts")),
        RunEvent::StageFinished { .. } | RunEvent::RunFinished { .. } => None,
    }
}

/// Per-host counts plus the overall verdict
#[must_use]
pub fn summary(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "SUMMARY{}", if report.dry_run { " (dry run)" } else { "" });

    for (host, counts) in report.summary() {
        let _ = write!(
            out,
            "  {host:<20} changed={:<3} ok={:<3} failed={}",
            counts.applied, counts.skipped, counts.failed
        );
        if report.dry_run {
            let _ = write!(out, " would_change={}", counts.would_apply);
        }
        let _ = writeln!(out);
    }

    let elapsed = report.finished_at - report.started_at;
    let verdict = match report.outcome {
        RunOutcome::Success => "succeeded",
        RunOutcome::Failed => "FAILED",
    };
    let _ = writeln!(
        out,
        "run {verdict} in {:.1}s",
        elapsed.num_milliseconds() as f64 / 1000.0
    );

    if let Some(stage) = report.first_failure() {
        out.push_str(&failure_detail(stage));
    }

    out
}

/// The failed stage with what went wrong on each host
#[must_use]
pub fn failure_detail(stage: &StageReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "stage {} failed:", stage.name);

    for host in &stage.hosts {
        match host.status {
            HostStatus::Succeeded => {}
            HostStatus::Cancelled => {
                let _ = writeln!(out, "  {}: cancelled", host.host);
            }
            HostStatus::Failed => {
                if let Some(error) = &host.error {
                    let _ = writeln!(out, "  {}: {error}", host.host);
                }
                for step in host.steps.iter().filter(|s| s.is_fatal()) {
                    let kind = step
                        .error_kind
                        .map(|k| format!("{k:?}"))
                        .unwrap_or_default();
                    let _ = writeln!(
                        out,
                        "  {}: {} [{kind}] {}",
                        host.host,
                        step.step,
                        step.message.as_deref().unwrap_or("")
                    );
                }
                for handler in host
                    .handlers
                    .iter()
                    .filter(|h| h.outcome == StepOutcome::Failed)
                {
                    let _ = writeln!(
                        out,
                        "  {}: handler {} {}",
                        host.host,
                        handler.handler,
                        handler.message.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::Utc;
    use kubestrap_core::{ErrorKind, HostStageReport, StepResult};

    use super::*;

    fn step(host: &str, name: &str, outcome: StepOutcome) -> StepResult {
        serde_json::from_value(serde_json::json!({
            "host": host,
            "step": name,
            "outcome": outcome,
            "attempts": 1,
            "duration": Duration::from_millis(5),
        }))
        .unwrap()
    }

    fn report(outcome: RunOutcome, stages: Vec<StageReport>) -> RunReport {
        let now = Utc::now();
        RunReport {
            outcome,
            dry_run: false,
            stages,
            facts: BTreeMap::new(),
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_event_lines() {
        let started = RunEvent::StageStarted {
            stage: "prepare".to_string(),
            hosts: vec!["cp-1".to_string(), "w-1".to_string()],
        };
        assert_eq!(event_line(&started).unwrap(), "==> prepare [cp-1, w-1]");

        let failed = RunEvent::StepFinished {
            stage: "prepare".to_string(),
            host: "w-1".to_string(),
            step: "install packages".to_string(),
            outcome: StepOutcome::Failed,
            message: Some("exit 100".to_string()),
        };
        assert_eq!(
            event_line(&failed).unwrap(),
            "    w-1: install packages ... failed (exit 100)"
        );

        let finished = RunEvent::RunFinished {
            outcome: RunOutcome::Success,
        };
        assert!(event_line(&finished).is_none());
    }

    #[test]
    fn test_summary_names_first_failed_stage() {
        let mut failed = step("w-1", "join cluster", StepOutcome::Failed);
        failed.message = Some("fact join_command not set".to_string());
        failed.error_kind = Some(ErrorKind::MissingDependency);

        let stage = StageReport {
            name: "worker-join".to_string(),
            role: "worker".to_string(),
            status: StageStatus::Failed,
            hosts: vec![HostStageReport {
                host: "w-1".to_string(),
                status: HostStatus::Failed,
                steps: vec![failed],
                handlers: Vec::new(),
                error: None,
            }],
            excluded: Vec::new(),
        };
        let text = summary(&report(RunOutcome::Failed, vec![stage]));

        assert!(text.contains("run FAILED"));
        assert!(text.contains("stage worker-join failed:"));
        assert!(text.contains("w-1: join cluster [MissingDependency] fact join_command not set"));
    }

    #[test]
    fn test_summary_counts() {
        let stage = StageReport {
            name: "prepare".to_string(),
            role: "all".to_string(),
            status: StageStatus::Succeeded,
            hosts: vec![HostStageReport {
                host: "cp-1".to_string(),
                status: HostStatus::Succeeded,
                steps: vec![
                    step("cp-1", "a", StepOutcome::Applied),
                    step("cp-1", "b", StepOutcome::Skipped),
                    step("cp-1", "c", StepOutcome::Skipped),
                ],
                handlers: Vec::new(),
                error: None,
            }],
            excluded: Vec::new(),
        };
        let text = summary(&report(RunOutcome::Success, vec![stage]));
        assert!(text.contains("changed=1"));
        assert!(text.contains("ok=2"));
        assert!(text.contains("run succeeded"));
        assert!(!text.contains("failed:"));
    }
}
