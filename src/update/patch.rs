// src/update/patch.rs

//! Unified-diff patcher for config files
//!
//! Hunks are placed at their recorded position or the nearest offset with
//! the fewest conflicts. Removed lines must match exactly; context lines
//! may drift as long as two of them still agree. A hunk whose new side is
//! already present is skipped. Hunks that cannot be placed are handed back
//! in [`PatchResult::failed`] rather than raised.

use crate::error::{Error, Result};
use tracing::debug;

const NO_NEWLINE: &[u8] = b"\\ No newline at end of file";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based ranges as written in the header
    header: (usize, usize, usize, usize),
    /// 0-based index of the first old line
    from_start: usize,
    from_len: usize,
    /// Lines with their ` `, `-` or `+` prefix
    lines: Vec<Vec<u8>>,
    context: usize,
}

impl Hunk {
    /// Resulting lines when placed at `at`; context comes from `src`
    fn apply<'a>(&'a self, src: &[&'a [u8]], at: usize) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        let mut from = at;
        for line in &self.lines {
            match line[0] {
                b' ' => {
                    if from < src.len() {
                        out.push(src[from]);
                        from += 1;
                    }
                }
                b'+' => out.push(&line[1..]),
                _ => from += 1,
            }
        }
        out
    }

    /// Conflicting line count at `at`, or -1 when the hunk is already applied
    fn count_conflicts(&self, src: &[&[u8]], at: isize) -> isize {
        let line_at = |i: isize| if i < 0 { None } else { src.get(i as usize).copied() };
        let mut conflicts = 0isize;
        let mut pos = at;
        for line in &self.lines {
            match line[0] {
                b' ' => {
                    if line_at(pos) != Some(&line[1..]) {
                        conflicts += 1;
                    }
                    pos += 1;
                }
                b'-' => {
                    // never erase a line that was changed locally
                    if line_at(pos) != Some(&line[1..]) {
                        conflicts = self.lines.len() as isize;
                    }
                    pos += 1;
                }
                _ => {}
            }
        }
        if conflicts == 0 {
            return 0;
        }

        let mut pos = at;
        let applied = self.lines.iter().filter(|l| l[0] != b'-').all(|line| {
            let ok = line_at(pos) == Some(&line[1..]);
            pos += 1;
            ok
        });
        if applied { -1 } else { conflicts }
    }

    pub fn to_text(&self) -> Vec<u8> {
        let (a, b, c, d) = self.header;
        let mut out = format!("@@ -{},{} +{},{} @@\n", a, b, c, d).into_bytes();
        for line in &self.lines {
            out.extend_from_slice(line);
            if !line.ends_with(b"\n") {
                out.push(b'\n');
                out.extend_from_slice(NO_NEWLINE);
                out.push(b'\n');
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchResult {
    pub contents: Vec<u8>,
    pub failed: Vec<Hunk>,
}

impl PatchResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    data.split_inclusive(|b| *b == b'\n').collect()
}

fn parse_range(field: &[u8], sign: u8) -> Result<(usize, usize)> {
    let bad = || Error::ParseError(format!("bad hunk range {}", String::from_utf8_lossy(field)));
    let rest = field.strip_prefix(&[sign]).ok_or_else(bad)?;
    let text = std::str::from_utf8(rest).map_err(|_| bad())?;
    let (start, len) = match text.split_once(',') {
        Some((s, l)) => (s, l),
        None => (text, "1"),
    };
    Ok((start.parse().map_err(|_| bad())?, len.parse().map_err(|_| bad())?))
}

/// Split a unified diff into hunks; `---`/`+++` file headers are skipped
pub fn parse_hunks(diff: &[u8]) -> Result<Vec<Hunk>> {
    let lines = split_lines(diff);
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if hunks.is_empty() && (line.starts_with(b"--- ") || line.starts_with(b"+++ ")) {
            i += 1;
            continue;
        }
        let fields: Vec<&[u8]> = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        if fields.len() < 4 || fields[0] != b"@@" || fields[3] != b"@@" {
            return Err(Error::ParseError(format!(
                "bad hunk header {}",
                String::from_utf8_lossy(line).trim_end()
            )));
        }
        let (from_start, from_len) = parse_range(fields[1], b'-')?;
        let (to_start, to_len) = parse_range(fields[2], b'+')?;

        let mut body: Vec<Vec<u8>> = Vec::new();
        let (mut from_count, mut to_count, mut context) = (0, 0, 0);
        i += 1;
        while i < lines.len() && !lines[i].starts_with(b"@") {
            let l = lines[i];
            match l.first() {
                Some(b' ') => {
                    from_count += 1;
                    to_count += 1;
                    context += 1;
                    body.push(l.to_vec());
                }
                // some tools drop the space of an empty context line
                Some(b'\n') => {
                    from_count += 1;
                    to_count += 1;
                    context += 1;
                    body.push(b" \n".to_vec());
                }
                Some(b'-') => {
                    from_count += 1;
                    body.push(l.to_vec());
                }
                Some(b'+') => {
                    to_count += 1;
                    body.push(l.to_vec());
                }
                Some(b'\\') if l.trim_ascii_end() == NO_NEWLINE => {
                    let last = body
                        .last_mut()
                        .ok_or_else(|| Error::ParseError("newline marker before any line".to_string()))?;
                    if last.ends_with(b"\n") {
                        last.pop();
                    }
                }
                _ => {
                    return Err(Error::ParseError(format!(
                        "bad hunk line {}",
                        String::from_utf8_lossy(l).trim_end()
                    )));
                }
            }
            i += 1;
        }
        if from_count != from_len || to_count != to_len {
            return Err(Error::ParseError(format!(
                "hunk @@ -{},{} +{},{} @@ has {} old and {} new lines",
                from_start, from_len, to_start, to_len, from_count, to_count
            )));
        }
        hunks.push(Hunk {
            header: (from_start, from_len, to_start, to_len),
            from_start: if from_len == 0 { from_start } else { from_start.saturating_sub(1) },
            from_len,
            lines: body,
            context,
        });
    }
    Ok(hunks)
}

/// Apply `diff` to `base`, collecting hunks that do not fit
pub fn patch(base: &[u8], diff: &[u8]) -> Result<PatchResult> {
    let hunks = parse_hunks(diff)?;
    let src = split_lines(base);
    let mut out: Vec<&[u8]> = Vec::with_capacity(src.len());
    let mut failed = Vec::new();
    let mut from_line = 0usize;
    let mut offset = 0isize;
    let total = hunks.len();

    for (idx, hunk) in hunks.iter().enumerate() {
        let start = hunk.from_start as isize + offset;
        let mut best = (hunk.count_conflicts(&src, start), 0isize);
        let mut i = 0isize;
        let last_start = src.len() as isize - hunk.from_len as isize;
        while best.0 != 0 {
            i += 1;
            let mut tried = false;
            if start - i >= 0 {
                tried = true;
                let c = hunk.count_conflicts(&src, start - i);
                if c < best.0 {
                    best = (c, -i);
                }
                if c == 0 {
                    break;
                }
            }
            if start + i <= last_start {
                tried = true;
                let c = hunk.count_conflicts(&src, start + i);
                if c < best.0 {
                    best = (c, i);
                }
                if c == 0 {
                    break;
                }
            }
            if !tried {
                break;
            }
        }

        let (conflicts, shift) = best;
        if conflicts == -1 {
            debug!("patch: hunk {} of {} already applied", idx + 1, total);
            continue;
        }
        let at = start + shift;
        if (conflicts > 0 && (hunk.context as isize - conflicts) < 2) || at < from_line as isize {
            debug!("patch: hunk {} of {} failed with {} conflict(s)", idx + 1, total, conflicts);
            failed.push(hunk.clone());
            continue;
        }
        offset += shift;
        let at = at as usize;
        out.extend_from_slice(&src[from_line..at.min(src.len())]);
        out.extend(hunk.apply(&src, at));
        from_line = (at + hunk.from_len).min(src.len());
    }
    out.extend_from_slice(&src[from_line.min(src.len())..]);

    Ok(PatchResult {
        contents: out.concat(),
        failed,
    })
}

/// Apply `diff` and insist every hunk lands
pub fn apply_strict(base: &[u8], diff: &[u8]) -> Result<Vec<u8>> {
    let result = patch(base, diff)?;
    if !result.is_clean() {
        return Err(Error::MergeConflict(format!("{} hunk(s) failed", result.failed.len())));
    }
    Ok(result.contents)
}

/// Failed hunks as a standalone unified diff for a `.conflicts` file
pub fn render_failed(failed: &[Hunk], old_name: &str, new_name: &str) -> Vec<u8> {
    let mut out = format!("--- {}\n+++ {}\n", old_name, new_name).into_bytes();
    for hunk in failed {
        out.extend(hunk.to_text());
    }
    out
}

/// Unified diff between two texts; empty when they are equal
pub fn unified_diff(old: &str, new: &str) -> Vec<u8> {
    if old == new {
        return Vec::new();
    }
    diffy::create_patch(old, new).to_string().into_bytes()
}
