//! Output truncation for tool results.
//!
//! Every tool whose output can grow without bound (shell commands, file
//! listings, search results) passes it through one of three entry points
//! before it reaches the model:
//!
//! - [`truncate_by_chars`]: raw character budget.
//! - [`truncate_by_lines`]: line budget plus a per-line character cap.
//! - [`truncate_array`]: item budget over a slice, rendered by a caller
//!   formatter.
//!
//! Each supports two policies. Head-only keeps the start and appends a
//! notice. Middle truncation keeps the start *and* the end and replaces the
//! middle span with a notice, so both the command line and the final state
//! of a long-running process stay visible.
//!
//! Content exactly at the limit is never truncated. When an [`Overflow`]
//! target is supplied and truncation happens, the full original content is
//! written to the [`OverflowStore`] and the file path is appended to the
//! result. Overflow failures are logged and otherwise ignored.

use std::path::Path;

use tracing::{debug, warn};

use crate::overflow::OverflowStore;

// ── Options ────────────────────────────────────────────────────────

/// Where to spill the full content when truncation happens.
#[derive(Debug, Clone, Copy)]
pub struct Overflow<'a> {
    pub store: &'a OverflowStore,
    pub working_dir: &'a Path,
    /// Name of the producing tool; becomes the overflow filename prefix.
    pub tool_name: Option<&'a str>,
}

/// Truncation policy shared by all entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncateOptions<'a> {
    /// Keep head and tail (`true`) or only the head (`false`).
    pub middle: bool,
    /// Spill target for the untruncated content.
    pub overflow: Option<Overflow<'a>>,
}

impl<'a> TruncateOptions<'a> {
    /// Head-only truncation without overflow.
    pub fn head() -> Self {
        Self::default()
    }

    /// Head+tail truncation without overflow.
    pub fn middle() -> Self {
        Self {
            middle: true,
            overflow: None,
        }
    }

    pub fn with_overflow(mut self, overflow: Overflow<'a>) -> Self {
        self.overflow = Some(overflow);
        self
    }
}

/// Singular/plural label for [`truncate_array`] notices.
#[derive(Debug, Clone, Copy)]
pub struct ItemLabel<'a> {
    pub singular: &'a str,
    pub plural: &'a str,
}

impl<'a> ItemLabel<'a> {
    pub const fn new(singular: &'a str, plural: &'a str) -> Self {
        Self { singular, plural }
    }

    fn for_count(&self, n: usize) -> &'a str {
        if n == 1 { self.singular } else { self.plural }
    }
}

// ── Results ────────────────────────────────────────────────────────

/// Result of [`truncate_by_chars`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub content: String,
    pub was_truncated: bool,
}

/// Result of [`truncate_by_lines`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTruncated {
    pub content: String,
    pub was_truncated: bool,
    pub original_lines: usize,
    pub shown_lines: usize,
}

/// Result of [`truncate_array`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayTruncated {
    pub content: String,
    pub was_truncated: bool,
    pub total_items: usize,
    pub shown_items: usize,
}

/// Marker appended to a line clipped by the per-line cap.
pub const LINE_TRUNCATED_MARKER: &str = "... [line truncated]";

// ── Entry points ───────────────────────────────────────────────────

/// Bound `text` to `max` characters.
pub fn truncate_by_chars(text: &str, max: usize, opts: &TruncateOptions<'_>) -> Truncated {
    let total = text.chars().count();
    if total <= max {
        return Truncated {
            content: text.to_string(),
            was_truncated: false,
        };
    }

    let mut content = if opts.middle {
        let half = max / 2;
        let head = take_chars(text, half);
        let tail = last_chars(text, total, half);
        let omitted = total - 2 * half;
        format!(
            "{head}\n\n[... {} characters omitted from the middle ...]\n\n{tail}",
            format_count(omitted)
        )
    } else {
        format!(
            "{}\n\n[Output truncated: showing {} of {} characters]",
            take_chars(text, max),
            format_count(max),
            format_count(total)
        )
    };
    debug!("Truncated {total} chars to {max} (middle: {})", opts.middle);

    append_overflow_pointer(&mut content, text, opts);
    Truncated {
        content,
        was_truncated: true,
    }
}

/// Bound `text` to `max_lines` lines, clipping each kept line to
/// `max_line_chars` characters.
///
/// Line-count and line-length notices are independent; both can appear.
pub fn truncate_by_lines(
    text: &str,
    max_lines: usize,
    max_line_chars: usize,
    opts: &TruncateOptions<'_>,
) -> LineTruncated {
    let lines: Vec<&str> = text.split('\n').collect();
    let original_lines = lines.len();
    let too_many = original_lines > max_lines;

    let (head, tail, omitted): (&[&str], &[&str], usize) = if !too_many {
        (&lines[..], &[], 0)
    } else if opts.middle {
        let half = max_lines / 2;
        (
            &lines[..half],
            &lines[original_lines - half..],
            original_lines - 2 * half,
        )
    } else {
        (&lines[..max_lines], &[], original_lines - max_lines)
    };
    let shown_lines = head.len() + tail.len();

    let mut clipped_any = false;
    let mut clip = |line: &str| -> String {
        if line.chars().count() > max_line_chars {
            clipped_any = true;
            format!("{}{LINE_TRUNCATED_MARKER}", take_chars(line, max_line_chars))
        } else {
            line.to_string()
        }
    };
    let head_out: Vec<String> = head.iter().map(|&l| clip(l)).collect();
    let tail_out: Vec<String> = tail.iter().map(|&l| clip(l)).collect();

    if !too_many && !clipped_any {
        return LineTruncated {
            content: text.to_string(),
            was_truncated: false,
            original_lines,
            shown_lines,
        };
    }

    let mut content = head_out.join("\n");
    if too_many && opts.middle {
        content.push_str(&format!(
            "\n\n[... {} lines omitted from the middle ...]\n\n",
            format_count(omitted)
        ));
        content.push_str(&tail_out.join("\n"));
    }

    let mut notices = Vec::new();
    if too_many && !opts.middle {
        notices.push(format!(
            "[Output truncated: showing {} of {} lines]",
            format_count(shown_lines),
            format_count(original_lines)
        ));
    }
    if clipped_any {
        notices.push(format!(
            "[Some lines exceeded {} characters and were truncated]",
            format_count(max_line_chars)
        ));
    }
    if !notices.is_empty() {
        content.push_str("\n\n");
        content.push_str(&notices.join("\n"));
    }

    append_overflow_pointer(&mut content, text, opts);
    LineTruncated {
        content,
        was_truncated: true,
        original_lines,
        shown_lines,
    }
}

/// Bound `items` to `max_items` entries, rendering kept items with
/// `format`.
///
/// `format` is called once per contiguous kept run (twice in middle mode)
/// and once more over the full slice when overflow is enabled.
pub fn truncate_array<T>(
    items: &[T],
    max_items: usize,
    format: impl Fn(&[T]) -> String,
    label: ItemLabel<'_>,
    opts: &TruncateOptions<'_>,
) -> ArrayTruncated {
    let total_items = items.len();
    if total_items <= max_items {
        return ArrayTruncated {
            content: format(items),
            was_truncated: false,
            total_items,
            shown_items: total_items,
        };
    }

    let (mut content, shown_items) = if opts.middle {
        let half = max_items / 2;
        let omitted = total_items - 2 * half;
        (
            format!(
                "{}\n\n[... {} {} omitted from the middle ...]\n\n{}",
                format(&items[..half]),
                format_count(omitted),
                label.for_count(omitted),
                format(&items[total_items - half..]),
            ),
            2 * half,
        )
    } else {
        (format(&items[..max_items]), max_items)
    };
    content.push_str(&format!(
        "\n\n[Showing {} of {} {}]",
        format_count(shown_items),
        format_count(total_items),
        label.for_count(total_items)
    ));

    if opts.overflow.is_some() {
        let full = format(items);
        append_overflow_pointer(&mut content, &full, opts);
    }
    ArrayTruncated {
        content,
        was_truncated: true,
        total_items,
        shown_items,
    }
}

/// Format a count with `,` thousands separators (`1234567` → `1,234,567`).
pub fn format_count(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ── Helpers ────────────────────────────────────────────────────────

fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => s.get(..idx).unwrap_or(s),
        None => s,
    }
}

fn last_chars(s: &str, total: usize, n: usize) -> &str {
    match s.char_indices().nth(total.saturating_sub(n)) {
        Some((idx, _)) => s.get(idx..).unwrap_or(""),
        None => "",
    }
}

fn append_overflow_pointer(content: &mut String, full: &str, opts: &TruncateOptions<'_>) {
    let Some(target) = opts.overflow else {
        return;
    };
    match target
        .store
        .write(full, target.working_dir, target.tool_name)
    {
        Ok(path) => {
            content.push_str(&format!("\n[Full output saved to: {}]", path.display()));
        }
        Err(e) => warn!("Overflow write failed, returning truncated output only: {e}"),
    }
}
