//! Keyword-overlap similarity between an AI's fresh answer and the group's
//! recent AI replies. A reply that is too similar is skipped: not
//! persisted, not broadcast.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Replies remembered per group.
const HISTORY_CAP: usize = 20;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "is", "are", "was", "to", "of", "in", "it", "i", "you",
    "we", "that", "this", "so", "but", "on", "for", "with", "be", "at", "by", "as",
    "我", "你", "的", "了", "是", "在", "也", "都", "和", "哈哈", "啊", "呢", "吗",
];

#[derive(Debug, Clone)]
struct ReplyRecord {
    ai_id: String,
    content: String,
    #[allow(dead_code)]
    at: DateTime<Utc>,
}

/// Tracks recent AI replies per group and answers "is this new reply too
/// close to something already said?".
#[derive(Default)]
pub struct SimilarityDetector {
    history: Mutex<HashMap<String, VecDeque<ReplyRecord>>>,
}

impl SimilarityDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, group_id: &str, ai_id: &str, content: &str) {
        let mut history = self.history.lock().unwrap();
        let ring = history.entry(group_id.to_string()).or_default();
        if ring.len() >= HISTORY_CAP {
            ring.pop_front();
        }
        ring.push_back(ReplyRecord {
            ai_id: ai_id.to_string(),
            content: content.to_string(),
            at: Utc::now(),
        });
    }

    /// Compare against the last `lookback` replies; returns the offending
    /// reply's author when any Jaccard similarity reaches `threshold`.
    pub fn check(
        &self,
        group_id: &str,
        content: &str,
        lookback: usize,
        threshold: f64,
    ) -> Option<String> {
        if lookback == 0 || threshold <= 0.0 {
            return None;
        }
        let history = self.history.lock().unwrap();
        let ring = history.get(group_id)?;
        for record in ring.iter().rev().take(lookback) {
            let similarity = jaccard(content, &record.content);
            debug!(group_id, similarity, "similarity comparison");
            if similarity >= threshold {
                warn!(
                    group_id,
                    against = %record.ai_id,
                    similarity,
                    threshold,
                    "reply too similar to a recent one"
                );
                return Some(record.ai_id.clone());
            }
        }
        None
    }
}

/// Jaccard similarity over extracted keywords.
fn jaccard(a: &str, b: &str) -> f64 {
    let ka = keywords(a);
    let kb = keywords(b);
    if ka.is_empty() || kb.is_empty() {
        return 0.0;
    }
    let intersection = ka.intersection(&kb).count();
    let union = ka.union(&kb).count();
    intersection as f64 / union as f64
}

/// Keyword extraction: strip @-mentions and punctuation, drop stopwords.
/// ASCII words are whole tokens; CJK text tokenizes per character.
fn keywords(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    for raw in text.split_whitespace() {
        if raw.starts_with('@') {
            continue;
        }
        let mut word = String::new();
        for c in raw.chars() {
            if c.is_ascii_alphanumeric() {
                word.push(c.to_ascii_lowercase());
            } else if !c.is_ascii() && c.is_alphanumeric() {
                // CJK and similar scripts carry meaning per character.
                let s = c.to_string();
                if !STOPWORDS.contains(&s.as_str()) {
                    out.insert(s);
                }
            } else if !word.is_empty() {
                push_word(&mut out, std::mem::take(&mut word));
            }
        }
        if !word.is_empty() {
            push_word(&mut out, word);
        }
    }
    out
}

fn push_word(out: &mut HashSet<String>, word: String) {
    if !STOPWORDS.contains(&word.as_str()) {
        out.insert(word);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_replies_are_caught() {
        let detector = SimilarityDetector::new();
        detector.record("g", "bot1", "coral reefs are full of life");
        let hit = detector.check("g", "coral reefs are full of life", 3, 0.6);
        assert_eq!(hit, Some("bot1".to_string()));
    }

    #[test]
    fn different_replies_pass() {
        let detector = SimilarityDetector::new();
        detector.record("g", "bot1", "coral reefs are full of life");
        let hit = detector.check("g", "volcanoes erupt with molten rock", 3, 0.6);
        assert!(hit.is_none());
    }

    #[test]
    fn lookback_bounds_the_comparison() {
        let detector = SimilarityDetector::new();
        detector.record("g", "bot1", "ancient duplicate answer here");
        for i in 0..3 {
            detector.record("g", "bot2", &format!("filler reply number {}", i));
        }
        // The duplicate is outside lookback=3.
        let hit = detector.check("g", "ancient duplicate answer here", 3, 0.6);
        assert!(hit.is_none());
    }

    #[test]
    fn mentions_are_ignored_in_keywords() {
        let a = keywords("@bot1 the reef is quiet");
        assert!(!a.iter().any(|k| k.contains("bot1")));
        assert!(a.contains("reef"));
        assert!(!a.contains("the"));
    }

    #[test]
    fn cjk_tokenizes_per_character() {
        let hit = jaccard("珊瑚礁很美", "珊瑚礁很美");
        assert!((hit - 1.0).abs() < 1e-9);
        assert!(jaccard("珊瑚礁", "火山岩") < 0.3);
    }

    #[test]
    fn zero_lookback_disables_detection() {
        let detector = SimilarityDetector::new();
        detector.record("g", "bot1", "same text");
        assert!(detector.check("g", "same text", 0, 0.6).is_none());
    }
}
