//! Log compression under a token budget
//!
//! Reduces a sanitized log to a target token count while keeping every
//! failure-signal line. Noise is dropped first: consecutive duplicate lines
//! collapse into repeat markers, then whole low-priority regions are elided,
//! then the middles of oversized regions are cut. Output line order always
//! matches input order.

use crate::error::Result;
use crate::extract::{is_failure_signal, is_warning_line};
use crate::tokens::TokenCounter;

const OMITTED_MARKER_COST: u32 = 8;

#[derive(Debug, Clone)]
pub struct CompressedLog {
    pub text: String,
    /// True when even the error regions did not fit the budget and had to be
    /// cut.
    pub truncated: bool,
    pub original_tokens: u32,
    pub compressed_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Priority {
    Info = 0,
    Warning = 1,
    Error = 2,
}

#[derive(Debug)]
struct Region {
    priority: Priority,
    start: usize,
    lines: Vec<String>,
    tokens: u32,
}

pub struct Compressor<'a> {
    counter: &'a TokenCounter,
    /// Context lines pulled into an error region around each signal line.
    error_context: usize,
}

impl<'a> Compressor<'a> {
    pub fn new(counter: &'a TokenCounter) -> Self {
        Self {
            counter,
            error_context: 2,
        }
    }

    /// Compress `text` to at most `budget` tokens for `model_family`.
    pub fn compress(&self, text: &str, budget: u32, model_family: &str) -> Result<CompressedLog> {
        let original_tokens = self.counter.count(text, model_family)?;
        if original_tokens <= budget {
            // Already under budget: idempotent no-op.
            return Ok(CompressedLog {
                text: text.to_string(),
                truncated: false,
                original_tokens,
                compressed_tokens: original_tokens,
            });
        }

        let deduped = dedup_consecutive(text);
        let regions = self.split_regions(&deduped, model_family)?;

        // Error regions are never elided. If they alone blow the budget, cut
        // their middle and report the truncation.
        let error_tokens: u32 = regions
            .iter()
            .filter(|r| r.priority == Priority::Error)
            .map(|r| r.tokens)
            .sum();
        if error_tokens > budget {
            let error_text: Vec<String> = regions
                .iter()
                .filter(|r| r.priority == Priority::Error)
                .flat_map(|r| r.lines.iter().cloned())
                .collect();
            let text = self.cut_middle_to_budget(error_text, budget, model_family)?;
            let compressed_tokens = self.counter.count(&text, model_family)?;
            return Ok(CompressedLog {
                text,
                truncated: true,
                original_tokens,
                compressed_tokens,
            });
        }

        // Greedy selection: errors first (all of them), then warnings, then
        // info, each priority in temporal order. The last region that does
        // not fit whole gets its middle cut; everything after it is elided.
        let mut keep = vec![false; regions.len()];
        let mut cut_region: Option<(usize, u32)> = None;
        let mut spent = 0u32;
        let mut order: Vec<usize> = (0..regions.len()).collect();
        order.sort_by_key(|&i| (std::cmp::Reverse(regions[i].priority), regions[i].start));

        for &i in &order {
            let region = &regions[i];
            if region.priority == Priority::Error || spent + region.tokens <= budget {
                keep[i] = true;
                spent += region.tokens;
            } else if cut_region.is_none() && budget.saturating_sub(spent) > OMITTED_MARKER_COST * 2
            {
                let allowance = budget - spent - OMITTED_MARKER_COST;
                cut_region = Some((i, allowance));
                spent = budget;
            }
        }

        let mut out_lines: Vec<String> = Vec::new();
        let mut omitted_run = 0usize;
        for (i, region) in regions.iter().enumerate() {
            if keep[i] {
                flush_omitted(&mut out_lines, &mut omitted_run);
                out_lines.extend(region.lines.iter().cloned());
            } else if let Some((cut_index, allowance)) = cut_region {
                if cut_index == i {
                    flush_omitted(&mut out_lines, &mut omitted_run);
                    let cut =
                        self.cut_middle_to_budget(region.lines.clone(), allowance, model_family)?;
                    out_lines.extend(cut.lines().map(|l| l.to_string()));
                    continue;
                }
                omitted_run += region.lines.len();
            } else {
                omitted_run += region.lines.len();
            }
        }
        flush_omitted(&mut out_lines, &mut omitted_run);

        let mut text = out_lines.join("\n");
        let mut compressed_tokens = self.counter.count(&text, model_family)?;
        let mut truncated = false;
        if compressed_tokens > budget {
            // Marker overhead pushed us over; trim from the middle.
            text = self.cut_middle_to_budget(
                text.lines().map(|l| l.to_string()).collect(),
                budget,
                model_family,
            )?;
            compressed_tokens = self.counter.count(&text, model_family)?;
            truncated = compressed_tokens > budget;
        }

        Ok(CompressedLog {
            text,
            truncated,
            original_tokens,
            compressed_tokens,
        })
    }

    fn split_regions(&self, lines: &[String], model_family: &str) -> Result<Vec<Region>> {
        let priorities: Vec<Priority> = lines
            .iter()
            .map(|l| {
                if is_failure_signal(l) {
                    Priority::Error
                } else if is_warning_line(l) {
                    Priority::Warning
                } else {
                    Priority::Info
                }
            })
            .collect();

        // Pull context lines around each signal into the error region.
        let mut effective = priorities.clone();
        for (i, p) in priorities.iter().enumerate() {
            if *p == Priority::Error {
                let lo = i.saturating_sub(self.error_context);
                let hi = (i + self.error_context).min(lines.len().saturating_sub(1));
                for slot in effective.iter_mut().take(hi + 1).skip(lo) {
                    *slot = Priority::Error.max(*slot);
                }
            }
        }

        let mut regions: Vec<Region> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let priority = effective[i];
            let tokens = self.counter.count(line, model_family)? + 1;
            let start_new = regions
                .last()
                .map(|last| last.priority != priority)
                .unwrap_or(true);
            if start_new {
                regions.push(Region {
                    priority,
                    start: i,
                    tokens: 0,
                    lines: Vec::new(),
                });
            }
            if let Some(last) = regions.last_mut() {
                last.tokens += tokens;
                last.lines.push(line.clone());
            }
        }
        Ok(regions)
    }

    /// Drop lines from the middle (keeping head and tail) until the joined
    /// text fits the budget, marking the cut. Falls back to character-level
    /// shrinking when even two lines are too big.
    fn cut_middle_to_budget(
        &self,
        mut lines: Vec<String>,
        budget: u32,
        model_family: &str,
    ) -> Result<String> {
        let fits = |text: &str, counter: &TokenCounter| -> Result<bool> {
            Ok(counter.count(text, model_family)? <= budget)
        };

        let mut removed = 0usize;
        loop {
            let text = render_cut(&lines, removed);
            if fits(&text, self.counter)? {
                return Ok(text);
            }
            if lines.len() <= 2 {
                break;
            }
            let mid = lines.len() / 2;
            lines.remove(mid);
            removed += 1;
        }

        // Character fallback for pathological single lines.
        let mut text = render_cut(&lines, removed);
        while self.counter.count(&text, model_family)? > budget && text.chars().count() > 8 {
            let chars: Vec<char> = text.chars().collect();
            let keep = chars.len() / 2;
            let head: String = chars[..keep / 2].iter().collect();
            let tail: String = chars[chars.len() - keep / 2..].iter().collect();
            text = format!("{head}\n[… truncated …]\n{tail}");
        }
        Ok(text)
    }
}

fn render_cut(lines: &[String], removed: usize) -> String {
    if removed == 0 {
        return lines.join("\n");
    }
    let mid = lines.len() / 2;
    let mut rendered: Vec<String> = Vec::with_capacity(lines.len() + 1);
    for (i, line) in lines.iter().enumerate() {
        rendered.push(line.clone());
        if i + 1 == mid {
            rendered.push(format!("[… {removed} lines omitted …]"));
        }
    }
    rendered.join("\n")
}

fn flush_omitted(out_lines: &mut Vec<String>, omitted_run: &mut usize) {
    if *omitted_run > 0 {
        out_lines.push(format!("[… {} lines omitted …]", *omitted_run));
        *omitted_run = 0;
    }
}

/// Collapse runs of identical consecutive lines into one line plus a
/// `[repeated k×]` marker.
fn dedup_consecutive(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut run: Option<(String, usize)> = None;
    for line in text.lines() {
        match &mut run {
            Some((current, count)) if current == line => *count += 1,
            _ => {
                if let Some((current, count)) = run.take() {
                    push_run(&mut out, current, count);
                }
                run = Some((line.to_string(), 1));
            }
        }
    }
    if let Some((current, count)) = run {
        push_run(&mut out, current, count);
    }
    out
}

fn push_run(out: &mut Vec<String>, line: String, count: usize) {
    if count > 1 {
        out.push(format!("{line} [repeated {count}×]"));
    } else {
        out.push(line);
    }
}
