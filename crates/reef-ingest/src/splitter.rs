//! Recursive character splitter.
//!
//! Splits on the first separator in the ladder that occurs in the text,
//! recursing into oversized pieces with the remaining separators, then
//! greedily merges pieces into chunks of at most `chunk_size` characters
//! with `chunk_overlap` characters carried between neighbours. Lengths are
//! measured in characters so CJK separators behave the same as ASCII ones.

use tracing::warn;

pub struct RecursiveCharacterSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl RecursiveCharacterSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize, separators: &[String]) -> Self {
        let mut separators: Vec<String> = separators.to_vec();
        if !separators.iter().any(|s| s.is_empty()) {
            separators.push(String::new());
        }
        let chunk_overlap = if chunk_overlap >= chunk_size {
            warn!(chunk_size, chunk_overlap, "overlap >= chunk size; halving");
            chunk_size / 2
        } else {
            chunk_overlap
        };
        Self {
            chunk_size,
            chunk_overlap,
            separators,
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        self.split_with(text, &self.separators)
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        // First separator that occurs in the text; the final "" always matches.
        let idx = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s.as_str()))
            .unwrap_or(separators.len() - 1);
        let separator = &separators[idx];
        let remaining = &separators[idx + 1..];

        let pieces: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator.as_str())
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        };

        let mut good: Vec<String> = Vec::new();
        let mut chunks: Vec<String> = Vec::new();
        for piece in pieces {
            if char_len(&piece) <= self.chunk_size {
                good.push(piece);
            } else {
                if !good.is_empty() {
                    chunks.extend(self.merge(&good, separator));
                    good.clear();
                }
                if remaining.is_empty() {
                    chunks.push(piece);
                } else {
                    chunks.extend(self.split_with(&piece, remaining));
                }
            }
        }
        if !good.is_empty() {
            chunks.extend(self.merge(&good, separator));
        }
        chunks
    }

    /// Greedy merge with overlap carry-over.
    fn merge(&self, pieces: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut chunks = Vec::new();
        let mut window: Vec<&String> = Vec::new();
        let mut total = 0usize;

        for piece in pieces {
            let piece_len = char_len(piece);
            let extra = if window.is_empty() { 0 } else { sep_len };
            if total + piece_len + extra > self.chunk_size && !window.is_empty() {
                chunks.push(join(&window, separator));
                // Drop from the front until the retained tail fits inside the
                // overlap budget and leaves room for the incoming piece.
                while total > self.chunk_overlap
                    || (total + piece_len + if window.is_empty() { 0 } else { sep_len }
                        > self.chunk_size
                        && total > 0)
                {
                    let first_len = char_len(window[0]);
                    total -= first_len + if window.len() > 1 { sep_len } else { 0 };
                    window.remove(0);
                }
            }
            let extra = if window.is_empty() { 0 } else { sep_len };
            total += piece_len + extra;
            window.push(piece);
        }
        if !window.is_empty() {
            chunks.push(join(&window, separator));
        }
        chunks.into_iter().filter(|c| !c.trim().is_empty()).collect()
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn join(pieces: &[&String], separator: &str) -> String {
    pieces
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_separators() -> Vec<String> {
        ["\n\n", "\n", "。", "！", "？", "，", " ", ""]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn uniform_text_yields_expected_chunk_count() {
        // 10,000 chars, size 500, overlap 100: each chunk advances 400
        // chars, so 25 chunks cover the text.
        let text: String = "a".repeat(10_000);
        let splitter = RecursiveCharacterSplitter::new(500, 100, &default_separators());
        let chunks = splitter.split(&text);
        assert_eq!(chunks.len(), 25);
        assert!(chunks.iter().all(|c| c.chars().count() <= 500));
        assert_eq!(chunks[0].chars().count(), 500);
    }

    #[test]
    fn paragraph_boundaries_are_preferred() {
        let text = format!("{}\n\n{}", "a".repeat(200), "b".repeat(200));
        let splitter = RecursiveCharacterSplitter::new(250, 0, &default_separators());
        let chunks = splitter.split(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert!(chunks[1].chars().all(|c| c == 'b'));
    }

    #[test]
    fn overlap_carries_tail_text() {
        let text: String = (0..26).map(|i| (b'a' + i) as char).collect::<String>().repeat(40);
        let splitter = RecursiveCharacterSplitter::new(100, 20, &default_separators());
        let chunks = splitter.split(&text);
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0].chars().rev().take(20).collect();
            let next_head: String = pair[1].chars().take(20).collect();
            let prev_tail: String = prev_tail.chars().rev().collect();
            assert_eq!(prev_tail, next_head);
        }
    }

    #[test]
    fn cjk_sentence_separators_split_cleanly() {
        let text = "珊瑚礁孕育鱼群。火山岩形成岛屿。海草床固定泥沙。";
        let splitter = RecursiveCharacterSplitter::new(10, 0, &default_separators());
        let chunks = splitter.split(text);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn short_text_is_one_chunk() {
        let splitter = RecursiveCharacterSplitter::new(500, 100, &default_separators());
        assert_eq!(splitter.split("short"), vec!["short".to_string()]);
        assert!(splitter.split("").is_empty());
    }
}
