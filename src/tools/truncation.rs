//! Head-first truncation of oversized tool output.

pub const MAX_LINES: usize = 2_000;
pub const MAX_BYTES: usize = 50 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub content: String,
    pub truncated: bool,
}

/// Keep the leading lines of `input` within `max_lines` and `max_bytes`.
pub fn truncate_head(input: &str, max_lines: usize, max_bytes: usize) -> Truncated {
    let lines: Vec<&str> = input.split('\n').collect();
    if lines.len() <= max_lines && input.len() <= max_bytes {
        return Truncated {
            content: input.to_string(),
            truncated: false,
        };
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut bytes = 0usize;
    let mut hit_bytes = false;
    for line in lines.iter().take(max_lines) {
        let size = line.len() + usize::from(!kept.is_empty());
        if bytes + size > max_bytes {
            hit_bytes = true;
            break;
        }
        kept.push(line);
        bytes += size;
    }

    let (removed, unit) = if hit_bytes {
        (input.len() - bytes, "bytes")
    } else {
        (lines.len() - kept.len(), "lines")
    };
    Truncated {
        content: format!("{}\n\n...{removed} {unit} truncated...", kept.join("\n")),
        truncated: true,
    }
}

/// [`truncate_head`] with the default limits.
pub fn truncate_output(input: &str) -> Truncated {
    truncate_head(input, MAX_LINES, MAX_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_is_untouched() {
        let result = truncate_output("one\ntwo");
        assert!(!result.truncated);
        assert_eq!(result.content, "one\ntwo");
    }

    #[test]
    fn line_limit_reports_removed_lines() {
        let input = (0..10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let result = truncate_head(&input, 4, MAX_BYTES);
        assert!(result.truncated);
        assert_eq!(result.content, "0\n1\n2\n3\n\n...6 lines truncated...");
    }

    #[test]
    fn byte_limit_reports_removed_bytes() {
        let input = "aaaa\nbbbb\ncccc";
        let result = truncate_head(input, 100, 9);
        assert!(result.truncated);
        assert_eq!(result.content, "aaaa\nbbbb\n\n...5 bytes truncated...");
    }
}
