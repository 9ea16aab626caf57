//! `<use_tool>` block scanning
//!
//! Scans the cumulative emitted text for complete tool blocks and reports
//! where forwarding must pause: at an unclosed opening tag, or at a trailing
//! partial opening marker that may become one once more text arrives.

/// Opening marker
pub const OPEN_TAG: &str = "<use_tool>";

/// Closing marker
pub const CLOSE_TAG: &str = "</use_tool>";

/// Incremental scanner over a growing buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolBlockScanner {
    scan_pos: usize,
    block_count: usize,
    last_block_end: Option<usize>,
    held_from: Option<usize>,
}

impl ToolBlockScanner {
    /// Create an empty scanner
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `text` (the full emitted buffer) for newly completed blocks
    ///
    /// Scanning stops after the first new block when `halt_after_block` is
    /// set, and once `max_blocks` blocks have completed. Returns the number of
    /// blocks completed by this call.
    pub fn scan(&mut self, text: &str, halt_after_block: bool, max_blocks: Option<usize>) -> usize {
        let mut completed = 0;
        self.held_from = None;

        loop {
            if max_blocks.is_some_and(|max| self.block_count >= max)
                || (halt_after_block && completed > 0)
            {
                break;
            }

            let rest = &text[self.scan_pos..];
            let Some(open) = rest.find(OPEN_TAG) else {
                let partial = partial_suffix(rest, OPEN_TAG);
                if partial > 0 {
                    self.held_from = Some(text.len() - partial);
                }
                break;
            };

            let open_at = self.scan_pos + open;
            let body_from = open_at + OPEN_TAG.len();
            let Some(close) = text[body_from..].find(CLOSE_TAG) else {
                self.held_from = Some(open_at);
                break;
            };

            let end = body_from + close + CLOSE_TAG.len();
            self.block_count += 1;
            self.last_block_end = Some(end);
            self.scan_pos = end;
            completed += 1;
        }

        completed
    }

    /// Number of complete blocks seen so far
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Byte offset just past the last complete block
    pub fn last_block_end(&self) -> Option<usize> {
        self.last_block_end
    }

    /// Offset where an unclosed block or partial marker begins
    pub fn held_from(&self) -> Option<usize> {
        self.held_from
    }

    /// How far text of length `len` may be forwarded
    ///
    /// With `withhold_tail` set and at least one complete block, nothing past
    /// the last block end is released.
    pub fn safe_end(&self, len: usize, withhold_tail: bool) -> usize {
        let mut end = self.held_from.map_or(len, |held| held.min(len));
        if withhold_tail && let Some(block_end) = self.last_block_end {
            end = end.min(block_end);
        }
        end
    }
}

/// Length of the longest proper prefix of `marker` that `text` ends with
fn partial_suffix(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&n| text.ends_with(&marker[..n]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_block() {
        let text = "a<use_tool>x</use_tool>b";
        let mut scanner = ToolBlockScanner::new();
        assert_eq!(scanner.scan(text, false, None), 1);
        assert_eq!(scanner.last_block_end(), Some(text.len() - 1));
        assert_eq!(scanner.safe_end(text.len(), false), text.len());
        assert_eq!(scanner.safe_end(text.len(), true), text.len() - 1);
    }

    #[test]
    fn test_unclosed_block_is_held() {
        let text = "hi <use_tool>{\"a\":";
        let mut scanner = ToolBlockScanner::new();
        assert_eq!(scanner.scan(text, false, None), 0);
        assert_eq!(scanner.safe_end(text.len(), false), 3);
    }

    #[test]
    fn test_partial_open_marker_is_held() {
        let text = "hello <use_t";
        let mut scanner = ToolBlockScanner::new();
        scanner.scan(text, false, None);
        assert_eq!(scanner.safe_end(text.len(), false), 6);

        // Not a marker after all
        let text = "hello <use_tx";
        scanner.scan(text, false, None);
        assert_eq!(scanner.safe_end(text.len(), false), text.len());
    }

    #[test]
    fn test_lone_angle_bracket_is_held() {
        let text = "a <";
        let mut scanner = ToolBlockScanner::new();
        scanner.scan(text, false, None);
        assert_eq!(scanner.safe_end(text.len(), false), 2);
    }

    #[test]
    fn test_halt_after_first_block() {
        let text = "<use_tool>1</use_tool><use_tool>2</use_tool>";
        let mut scanner = ToolBlockScanner::new();
        assert_eq!(scanner.scan(text, true, None), 1);
        assert_eq!(scanner.block_count(), 1);
        assert_eq!(scanner.last_block_end(), Some(22));
    }

    #[test]
    fn test_max_blocks_caps_scanning() {
        let text = "<use_tool>1</use_tool><use_tool>2</use_tool><use_tool>3</use_tool>";
        let mut scanner = ToolBlockScanner::new();
        assert_eq!(scanner.scan(text, false, Some(2)), 2);
        assert_eq!(scanner.scan(text, false, Some(2)), 0);
        assert_eq!(scanner.block_count(), 2);
    }

    #[test]
    fn test_incremental_scan() {
        let mut scanner = ToolBlockScanner::new();
        let mut text = String::from("<use_tool>{\"q\"");
        assert_eq!(scanner.scan(&text, false, None), 0);
        text.push_str(":1}</use_");
        assert_eq!(scanner.scan(&text, false, None), 0);
        assert_eq!(scanner.safe_end(text.len(), false), 0);
        text.push_str("tool> done");
        assert_eq!(scanner.scan(&text, false, None), 1);
        assert_eq!(scanner.safe_end(text.len(), false), text.len());
    }
}
