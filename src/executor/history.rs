use crate::config::HistoryConfig;

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// The task briefing; always kept verbatim at position zero.
    Briefing,
    Assistant,
    Observation,
    /// A compression artifact replacing an older block.
    Summary,
}

impl Speaker {
    fn label(&self) -> &'static str {
        match self {
            Self::Briefing => "briefing",
            Self::Assistant => "assistant",
            Self::Observation => "observation",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub speaker: Speaker,
    pub content: String,
}

/// Bounded message history for one subtask's step loop.
///
/// Compression fires on message count, accumulated bytes, or a periodic
/// step cadence; the oldest block collapses into a single summary message
/// while the briefing and the latest `keep_recent` messages stay verbatim.
#[derive(Debug)]
pub struct StepHistory {
    config: HistoryConfig,
    messages: Vec<HistoryMessage>,
    steps_since_compress: usize,
}

impl StepHistory {
    pub fn new(config: HistoryConfig, briefing: String) -> Self {
        Self {
            config,
            messages: vec![HistoryMessage {
                speaker: Speaker::Briefing,
                content: briefing,
            }],
            steps_since_compress: 0,
        }
    }

    pub fn push(&mut self, speaker: Speaker, content: impl Into<String>) {
        self.messages.push(HistoryMessage {
            speaker,
            content: content.into(),
        });
    }

    pub fn note_step(&mut self) {
        self.steps_since_compress += 1;
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }

    /// Whether a compression pass is due and worthwhile.
    pub fn needs_compression(&self) -> bool {
        if self.compressible_range().len() < self.config.min_compress {
            return false;
        }
        self.messages.len() > self.config.compress_after_messages
            || self.byte_len() > self.config.compress_after_bytes
            || self.steps_since_compress >= self.config.period_steps
    }

    fn compressible_range(&self) -> std::ops::Range<usize> {
        let end = self.messages.len().saturating_sub(self.config.keep_recent);
        if end <= 1 {
            return 1..1;
        }
        1..end
    }

    /// The block a summarizer should condense.
    pub fn compressible_text(&self) -> String {
        self.messages[self.compressible_range()]
            .iter()
            .map(|m| format!("[{}] {}", m.speaker.label(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Replace the compressible block with one summary message.
    pub fn apply_compression(&mut self, summary: String) {
        let range = self.compressible_range();
        if range.is_empty() {
            return;
        }
        let replaced = range.len();
        self.messages.splice(
            range,
            [HistoryMessage {
                speaker: Speaker::Summary,
                content: format!("(summary of {} earlier messages) {}", replaced, summary),
            }],
        );
        self.steps_since_compress = 0;
    }

    /// Render for the executor prompt.
    pub fn render(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{}] {}", m.speaker.label(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HistoryConfig {
        HistoryConfig {
            compress_after_messages: 8,
            compress_after_bytes: 10_000,
            period_steps: 100,
            keep_recent: 3,
            min_compress: 2,
        }
    }

    #[test]
    fn compression_keeps_briefing_and_recent() {
        let mut history = StepHistory::new(config(), "briefing text".into());
        for i in 0..10 {
            history.push(Speaker::Observation, format!("obs {}", i));
        }
        assert!(history.needs_compression());

        history.apply_compression("older observations condensed".into());

        assert_eq!(history.messages[0].speaker, Speaker::Briefing);
        assert_eq!(history.messages[1].speaker, Speaker::Summary);
        // briefing + summary + keep_recent
        assert_eq!(history.len(), 2 + 3);
        let rendered = history.render();
        assert!(rendered.contains("briefing text"));
        assert!(rendered.contains("obs 9"));
        assert!(!rendered.contains("obs 2"));
    }

    #[test]
    fn small_histories_do_not_compress() {
        let mut history = StepHistory::new(config(), "b".into());
        history.push(Speaker::Observation, "only one");
        assert!(!history.needs_compression());
    }

    #[test]
    fn byte_threshold_triggers_compression() {
        let mut history = StepHistory::new(config(), "b".into());
        for _ in 0..6 {
            history.push(Speaker::Observation, "x".repeat(2_500));
        }
        assert!(history.needs_compression());
    }

    #[test]
    fn periodic_compression_resets_counter() {
        let mut history = StepHistory::new(
            HistoryConfig {
                period_steps: 2,
                ..config()
            },
            "b".into(),
        );
        for i in 0..6 {
            history.push(Speaker::Observation, format!("obs {}", i));
        }
        history.note_step();
        history.note_step();
        assert!(history.needs_compression());
        history.apply_compression("s".into());
        assert!(!history.needs_compression());
    }
}
