//! Cross-chunk stop-string matching.
//!
//! The matcher buffers incoming text and releases only the part that can no
//! longer participate in a stop-string match, so a stop split across chunk
//! boundaries is still caught. The retained tail is the longest buffer
//! suffix that is a proper prefix of any stop string, which is always
//! shorter than the longest stop string.

/// Result of feeding one chunk into the matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopScan {
    /// No match yet; `emit` is safe to forward (may be empty).
    Continue { emit: String },
    /// A stop string matched. `emit` holds the text before the match (plus
    /// the stop itself when configured); everything after is discarded.
    Stopped { emit: String },
}

/// Rolling-buffer matcher over an ordered stop-string list.
#[derive(Debug)]
pub struct StopMatcher {
    stops: Vec<String>,
    emit_stop_fragment: bool,
    buffer: String,
    done: bool,
}

impl StopMatcher {
    pub fn new(stops: Vec<String>, emit_stop_fragment: bool) -> Self {
        Self {
            stops: stops.into_iter().filter(|s| !s.is_empty()).collect(),
            emit_stop_fragment,
            buffer: String::new(),
            done: false,
        }
    }

    /// Whether a stop string has already matched.
    pub fn matched(&self) -> bool {
        self.done
    }

    /// Feed one chunk of generated text.
    pub fn push(&mut self, chunk: &str) -> StopScan {
        if self.done {
            return StopScan::Stopped {
                emit: String::new(),
            };
        }
        self.buffer.push_str(chunk);

        if self.stops.is_empty() {
            return StopScan::Continue {
                emit: std::mem::take(&mut self.buffer),
            };
        }

        // Earliest occurrence wins; configured order breaks position ties.
        let mut best: Option<(usize, usize)> = None;
        for (idx, stop) in self.stops.iter().enumerate() {
            if let Some(pos) = self.buffer.find(stop.as_str()) {
                if best.map_or(true, |(p, _)| pos < p) {
                    best = Some((pos, idx));
                }
            }
        }

        if let Some((pos, idx)) = best {
            let mut emit = self.buffer[..pos].to_string();
            if self.emit_stop_fragment {
                emit.push_str(&self.stops[idx]);
            }
            self.buffer.clear();
            self.done = true;
            return StopScan::Stopped { emit };
        }

        let hold = self.holdback_len();
        let split = self.buffer.len() - hold;
        let emit = self.buffer[..split].to_string();
        self.buffer.drain(..split);
        StopScan::Continue { emit }
    }

    /// End of stream without a match: release the retained tail.
    pub fn flush(&mut self) -> String {
        if self.done {
            return String::new();
        }
        std::mem::take(&mut self.buffer)
    }

    /// Byte length of the longest buffer suffix that is a proper prefix of
    /// some stop string. Splitting there keeps both sides on char
    /// boundaries because the suffix equals an exact prefix of a stop.
    fn holdback_len(&self) -> usize {
        let mut best = 0usize;
        for stop in &self.stops {
            let mut boundaries: Vec<usize> = stop
                .char_indices()
                .map(|(i, _)| i)
                .filter(|&i| i > 0)
                .collect();
            boundaries.push(stop.len());
            // Proper prefixes only; a full match was handled above.
            for &end in boundaries.iter().rev() {
                if end >= stop.len() {
                    continue;
                }
                if end <= best || end > self.buffer.len() {
                    continue;
                }
                if self.buffer.ends_with(&stop[..end]) {
                    best = end;
                    break;
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(stops: &[&str]) -> StopMatcher {
        StopMatcher::new(stops.iter().map(|s| s.to_string()).collect(), false)
    }

    #[test]
    fn test_no_stops_passes_through() {
        let mut m = matcher(&[]);
        assert_eq!(
            m.push("hello"),
            StopScan::Continue {
                emit: "hello".into()
            }
        );
    }

    #[test]
    fn test_match_within_single_chunk() {
        let mut m = matcher(&["STOP"]);
        assert_eq!(
            m.push("before STOP after"),
            StopScan::Stopped {
                emit: "before ".into()
            }
        );
        assert!(m.matched());
    }

    #[test]
    fn test_cross_chunk_match() {
        // The scenario from the wire contract: "\n\nUser:" split over two
        // chunks must yield exactly the text before the stop.
        let mut m = matcher(&["\n\nUser:"]);
        assert_eq!(
            m.push("Hi there.\n"),
            StopScan::Continue {
                emit: "Hi there.".into()
            }
        );
        assert_eq!(
            m.push("\nUser:"),
            StopScan::Stopped { emit: "".into() }
        );
    }

    #[test]
    fn test_partial_prefix_released_when_disproven() {
        let mut m = matcher(&["<|end|>"]);
        assert_eq!(m.push("a<"), StopScan::Continue { emit: "a".into() });
        // "<x" disproves the pending prefix; everything is released.
        assert_eq!(
            m.push("x"),
            StopScan::Continue { emit: "<x".into() }
        );
    }

    #[test]
    fn test_earliest_occurrence_wins() {
        let mut m = matcher(&["BBB", "AA"]);
        assert_eq!(
            m.push("xAAyBBB"),
            StopScan::Stopped { emit: "x".into() }
        );
    }

    #[test]
    fn test_configured_order_breaks_ties() {
        let mut m = matcher(&["ab", "abc"]);
        assert_eq!(m.push("xxab"), StopScan::Stopped { emit: "xx".into() });
    }

    #[test]
    fn test_emit_stop_fragment_opt_in() {
        let mut m = StopMatcher::new(vec!["STOP".into()], true);
        assert_eq!(
            m.push("a STOP b"),
            StopScan::Stopped {
                emit: "a STOP".into()
            }
        );
    }

    #[test]
    fn test_flush_releases_tail() {
        let mut m = matcher(&["END"]);
        assert_eq!(m.push("abcE"), StopScan::Continue { emit: "abc".into() });
        assert_eq!(m.flush(), "E");
    }

    #[test]
    fn test_multibyte_stop_boundaries() {
        let mut m = matcher(&["——stop"]);
        let out = m.push("text—");
        assert_eq!(
            out,
            StopScan::Continue {
                emit: "text".into()
            }
        );
        assert_eq!(
            m.push("—stop now"),
            StopScan::Stopped { emit: "".into() }
        );
    }

    #[test]
    fn test_any_chunking_yields_same_prefix() {
        // Property: for a fixed text and stop set, every chunking emits the
        // same concatenated prefix.
        let text = "alpha beta\n\nUser: gamma";
        let stops = ["\n\nUser:"];
        let expected = "alpha beta";
        for split in 1..text.len() {
            if !text.is_char_boundary(split) {
                continue;
            }
            let mut m = matcher(&stops);
            let mut got = String::new();
            let mut stopped = false;
            for chunk in [&text[..split], &text[split..]] {
                match m.push(chunk) {
                    StopScan::Continue { emit } => got.push_str(&emit),
                    StopScan::Stopped { emit } => {
                        got.push_str(&emit);
                        stopped = true;
                        break;
                    }
                }
            }
            assert!(stopped, "split at {split} missed the stop");
            assert_eq!(got, expected, "split at {split}");
        }
    }
}
