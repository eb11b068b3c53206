//! Accumulation of stream deltas into snapshots
//!
//! Deltas are appended to per-request buffers; every emission hands out the
//! full accumulated text, never a fragment.

use super::sse::Delta;
use crate::chat::MessageUpdate;

/// Full accumulated text of a response so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Answer text
    pub content: String,
    /// Reasoning text
    pub reasoning_content: String,
}

impl Snapshot {
    /// Message update carrying this snapshot
    ///
    /// Empty reasoning is left out so a stored message without reasoning
    /// keeps `reasoning_content` unset.
    pub fn to_update(&self, updating: bool) -> MessageUpdate {
        MessageUpdate {
            content: Some(self.content.clone()),
            reasoning_content: Some(self.reasoning_content.clone())
                .filter(|reasoning| !reasoning.is_empty()),
            updating: Some(updating),
        }
    }

    /// True when neither field holds text
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning_content.is_empty()
    }
}

/// Where `content` fragments go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ContentRouting {
    /// Content is the answer
    #[default]
    Direct,
    /// Content is reasoning until one of the end markers, the answer after it
    ReasoningUntil(Vec<String>),
}

/// Per-request delta accumulator
#[derive(Debug, Default)]
pub struct Accumulator {
    routing: ContentRouting,
    content: String,
    reasoning: String,
    snapshot: Snapshot,
}

impl Accumulator {
    /// Create an empty accumulator
    pub fn new(routing: ContentRouting) -> Self {
        Self {
            routing,
            ..Self::default()
        }
    }

    /// Append a delta; returns whether the snapshot changed
    pub fn push(&mut self, delta: &Delta) -> bool {
        if delta.is_empty() {
            return false;
        }
        if let Some(text) = &delta.content {
            self.content.push_str(text);
        }
        if let Some(text) = &delta.reasoning_content {
            self.reasoning.push_str(text);
        }
        self.rebuild();
        true
    }

    /// Current snapshot
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    fn rebuild(&mut self) {
        match &self.routing {
            ContentRouting::Direct => {
                self.snapshot.content.clone_from(&self.content);
                self.snapshot.reasoning_content.clone_from(&self.reasoning);
            }
            ContentRouting::ReasoningUntil(markers) => {
                let (thought, answer) = split_at_end_marker(&self.content, markers);
                let mut reasoning = self.reasoning.clone();
                reasoning.push_str(thought);
                self.snapshot.reasoning_content = reasoning;
                self.snapshot.content = answer.trim_start().to_string();
            }
        }
    }
}

/// Split `content` at the earliest end marker, dropping the marker itself
fn split_at_end_marker<'a>(content: &'a str, markers: &[String]) -> (&'a str, &'a str) {
    let found = markers
        .iter()
        .filter(|marker| !marker.is_empty())
        .filter_map(|marker| content.find(marker.as_str()).map(|pos| (pos, marker.len())))
        .min_by_key(|(pos, _)| *pos);

    match found {
        Some((pos, len)) => (&content[..pos], &content[pos + len..]),
        None => (content, ""),
    }
}

/// Decision on whether the first snapshot may be emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Content does not look like reasoning
    Clear,
    /// Too little content to decide
    Withhold,
    /// Content starts with the given marker
    Misfiled(String),
}

/// Detects reasoning tokens sent in the answer field
#[derive(Debug, Clone)]
pub struct MisfiledReasoningDetector {
    markers: Vec<String>,
}

impl MisfiledReasoningDetector {
    /// Create a detector; markers are compared trimmed and lowercased
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let markers = markers
            .into_iter()
            .map(|marker| marker.as_ref().trim().to_lowercase())
            .filter(|marker| !marker.is_empty())
            .collect();
        Self { markers }
    }

    /// Classify the snapshot
    ///
    /// # Examples
    ///
    /// ```
    /// use chatshard::completion::{MisfiledReasoningDetector, Snapshot, Verdict};
    ///
    /// let detector = MisfiledReasoningDetector::new(["think"]);
    /// let snapshot = |text: &str| Snapshot {
    ///     content: text.to_string(),
    ///     ..Default::default()
    /// };
    /// assert_eq!(detector.check(&snapshot("thi")), Verdict::Withhold);
    /// assert_eq!(
    ///     detector.check(&snapshot("Think: first")),
    ///     Verdict::Misfiled("think".to_string())
    /// );
    /// assert_eq!(detector.check(&snapshot("The answer")), Verdict::Clear);
    /// ```
    pub fn check(&self, snapshot: &Snapshot) -> Verdict {
        let head = snapshot.content.trim_start().to_lowercase();
        if head.is_empty() {
            // Reasoning arriving in its own field settles the question.
            return if snapshot.reasoning_content.is_empty() {
                Verdict::Withhold
            } else {
                Verdict::Clear
            };
        }

        if let Some(marker) = self.markers.iter().find(|m| head.starts_with(m.as_str())) {
            return Verdict::Misfiled(marker.clone());
        }
        if self.markers.iter().any(|m| m.starts_with(head.as_str())) {
            return Verdict::Withhold;
        }
        Verdict::Clear
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> Delta {
        Delta {
            content: Some(text.to_string()),
            reasoning_content: None,
        }
    }

    fn reasoning(text: &str) -> Delta {
        Delta {
            content: None,
            reasoning_content: Some(text.to_string()),
        }
    }

    #[test]
    fn test_direct_accumulation() {
        let mut acc = Accumulator::new(ContentRouting::Direct);
        assert!(acc.push(&content("He")));
        assert!(acc.push(&reasoning("why")));
        assert!(acc.push(&content("llo")));
        assert!(!acc.push(&Delta::default()));

        assert_eq!(acc.snapshot().content, "Hello");
        assert_eq!(acc.snapshot().reasoning_content, "why");
    }

    #[test]
    fn test_routing_until_end_marker() {
        let markers = vec!["</think>".to_string()];
        let mut acc = Accumulator::new(ContentRouting::ReasoningUntil(markers));

        acc.push(&content("think: the user wants"));
        assert_eq!(acc.snapshot().content, "");
        assert_eq!(acc.snapshot().reasoning_content, "think: the user wants");

        acc.push(&content(" a greeting</thi"));
        acc.push(&content("nk>\n\nHello!"));
        assert_eq!(
            acc.snapshot().reasoning_content,
            "think: the user wants a greeting"
        );
        assert_eq!(acc.snapshot().content, "Hello!");
    }

    #[test]
    fn test_routing_without_marker_keeps_everything_as_reasoning() {
        let mut acc = Accumulator::new(ContentRouting::ReasoningUntil(vec!["</think>".into()]));
        acc.push(&content("still thinking"));
        assert_eq!(acc.snapshot().content, "");
        assert_eq!(acc.snapshot().reasoning_content, "still thinking");
    }

    #[test]
    fn test_update_omits_empty_reasoning() {
        let snapshot = Snapshot {
            content: "Hi".to_string(),
            reasoning_content: String::new(),
        };
        let update = snapshot.to_update(true);
        assert_eq!(update.content.as_deref(), Some("Hi"));
        assert_eq!(update.reasoning_content, None);
        assert_eq!(update.updating, Some(true));
    }

    #[test]
    fn test_detector_verdicts() {
        let detector = MisfiledReasoningDetector::new(["  Think ", "<think>"]);
        let verdict = |text: &str| {
            detector.check(&Snapshot {
                content: text.to_string(),
                reasoning_content: String::new(),
            })
        };

        assert_eq!(verdict(""), Verdict::Withhold);
        assert_eq!(verdict("  "), Verdict::Withhold);
        assert_eq!(verdict("thi"), Verdict::Withhold);
        assert_eq!(verdict("<th"), Verdict::Withhold);
        assert_eq!(verdict("think:"), Verdict::Misfiled("think".to_string()));
        assert_eq!(verdict("  THINKING"), Verdict::Misfiled("think".to_string()));
        assert_eq!(verdict("<think>x"), Verdict::Misfiled("<think>".to_string()));
        assert_eq!(verdict("Hello"), Verdict::Clear);
        assert_eq!(verdict("th3"), Verdict::Clear);
    }

    #[test]
    fn test_detector_clears_on_reasoning_field() {
        let detector = MisfiledReasoningDetector::new(["think"]);
        let snapshot = Snapshot {
            content: String::new(),
            reasoning_content: "proper field".to_string(),
        };
        assert_eq!(detector.check(&snapshot), Verdict::Clear);
    }
}
