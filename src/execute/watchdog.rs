//! Output-quality watchdog for running tasks.
//!
//! While a task streams output, the watchdog scores the accumulated text for
//! minimum progress: non-empty, not an echo of the prompt, and not dominated
//! by pathological repetition. A low score sustained past the grace period
//! cancels the task with `LowQualityOutput`.

use regex::Regex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why output was judged low-quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Ok,
    Empty,
    PromptEcho,
    Repetitive,
}

impl Quality {
    pub fn is_low(&self) -> bool {
        !matches!(self, Self::Ok)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Empty => "no output produced",
            Self::PromptEcho => "output echoes the prompt",
            Self::Repetitive => "output repetition ratio above threshold",
        }
    }
}

/// Score accumulated output against the prompt.
pub fn score_output(output: &str, prompt: &str, repetition_threshold: f64) -> Quality {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Quality::Empty;
    }

    // Echo check: a long output that is substantially a substring of the
    // prompt is the model reciting its input back.
    if trimmed.len() >= 80 {
        let normalized_output = normalize(trimmed);
        let normalized_prompt = normalize(prompt);
        let probe: String = normalized_output.chars().take(400).collect();
        if probe.len() >= 80 && normalized_prompt.contains(&probe) {
            return Quality::PromptEcho;
        }
    }

    if repetition_ratio(trimmed) > repetition_threshold {
        return Quality::Repetitive;
    }

    Quality::Ok
}

fn normalize(text: &str) -> String {
    let squash = Regex::new(r"\s+").expect("static regex");
    squash.replace_all(text, " ").to_lowercase()
}

/// Fraction of non-blank lines that are duplicates of an earlier line.
/// Short outputs score 0.0; repetition only becomes meaningful with volume.
pub fn repetition_ratio(text: &str) -> f64 {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.len() < 8 {
        return 0.0;
    }
    let unique: std::collections::HashSet<&str> = lines.iter().copied().collect();
    1.0 - (unique.len() as f64 / lines.len() as f64)
}

/// Configuration for one watchdog run.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How long low-quality output is tolerated before cancellation.
    pub grace: Duration,
    pub repetition_threshold: f64,
    /// Scoring cadence.
    pub check_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(120),
            repetition_threshold: 0.6,
            check_interval: Duration::from_secs(2),
        }
    }
}

/// Watch a task's output chunks; cancel the task when quality stays low past
/// the grace period. Returns the tripped reason, or None when the task ended
/// first.
pub async fn watch(
    config: WatchdogConfig,
    prompt: String,
    mut chunks: mpsc::UnboundedReceiver<String>,
    task_cancel: CancellationToken,
) -> Option<&'static str> {
    let mut accumulated = String::new();
    let mut low_since: Option<tokio::time::Instant> = None;
    let mut interval = tokio::time::interval(config.check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                match chunk {
                    Some(text) => {
                        accumulated.push_str(&text);
                        accumulated.push('\n');
                    }
                    // Producer gone: the task finished on its own.
                    None => return None,
                }
            }
            _ = interval.tick() => {
                let quality = score_output(&accumulated, &prompt, config.repetition_threshold);
                if quality.is_low() {
                    let since = low_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() >= config.grace {
                        tracing::warn!(reason = quality.describe(), "Output watchdog tripped");
                        task_cancel.cancel();
                        return Some(quality.describe());
                    }
                } else {
                    low_since = None;
                }
            }
        }
    }
}
