//! Collapsed stack format, compatible with Brendan Gregg's FlameGraph
//! tooling: one line per unique stack, `frame1;frame2;...;frameN count`,
//! root→leaf, lines sorted lexicographically.

use std::collections::BTreeMap;

use crate::frame::Frame;

/// Render weighted leaf-first stacks as collapsed lines.
///
/// Stacks whose rendered form is identical are summed. Samples with no
/// frames are skipped. Every emitted line ends in a newline.
pub fn render<'a>(stacks: impl Iterator<Item = (&'a [Frame], u64)>) -> String {
    // BTreeMap gives the lexicographic line order for free.
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();

    for (frames, count) in stacks {
        if frames.is_empty() {
            continue;
        }
        let mut labels: Vec<String> = frames.iter().map(Frame::collapsed_label).collect();
        // Captured leaf-first; the collapsed format wants root→leaf.
        labels.reverse();
        *counts.entry(labels.join(";")).or_insert(0) += count;
    }

    let mut out = String::new();
    for (stack, count) in counts {
        out.push_str(&stack);
        out.push(' ');
        out.push_str(&count.to_string());
        out.push('\n');
    }
    out
}

/// Parse collapsed text back into `(root→leaf labels, count)` pairs.
///
/// Used to verify round-trips; frame labels are not split back into their
/// name/file/line parts.
pub fn parse(text: &str) -> Vec<(Vec<String>, u64)> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some((stack, count)) = line.rsplit_once(' ') else {
            continue;
        };
        let Ok(count) = count.parse::<u64>() else {
            continue;
        };
        out.push((stack.split(';').map(str::to_string).collect(), count));
    }
    out
}
