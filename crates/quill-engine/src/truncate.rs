use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use quill_core::ids::{now_millis, ToolOutputId};
use quill_core::tools::TruncateDirection;

/// Line cap on tool output handed back to the model.
pub const MAX_LINES: usize = 2000;
/// Byte cap on tool output handed back to the model.
pub const MAX_BYTES: usize = 51200;

/// Spill files older than this are garbage collected.
const SPILL_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// The marker and hint appended to a preview consume part of the line budget.
const MARKER_LINES: usize = 3;

/// Result of running one tool output through the truncator.
#[derive(Clone, Debug)]
pub struct TruncatedOutput {
    pub content: String,
    pub truncated: bool,
    /// Where the full text was spilled, when truncated.
    pub spill: Option<PathBuf>,
}

/// Caps tool output at [`MAX_LINES`]/[`MAX_BYTES`], spilling the full text to
/// `<data>/tool-output/<id>`. Spill file names are tool-output ids, so file
/// age is recoverable from the name alone.
pub struct Truncator {
    spill_dir: PathBuf,
    gc_done: AtomicBool,
}

impl Truncator {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            spill_dir: data_dir.into().join("tool-output"),
            gc_done: AtomicBool::new(false),
        }
    }

    pub fn spill_dir(&self) -> &PathBuf {
        &self.spill_dir
    }

    /// Identity for output within both bounds; otherwise spill and preview.
    pub fn process(
        &self,
        output: &str,
        direction: TruncateDirection,
    ) -> std::io::Result<TruncatedOutput> {
        let total_lines = output.lines().count();
        if total_lines <= MAX_LINES && output.len() <= MAX_BYTES {
            return Ok(TruncatedOutput {
                content: output.to_string(),
                truncated: false,
                spill: None,
            });
        }

        self.maybe_gc();

        std::fs::create_dir_all(&self.spill_dir)?;
        let id = ToolOutputId::new();
        let spill_path = self.spill_dir.join(id.as_str());
        std::fs::write(&spill_path, output)?;

        let budget = MAX_LINES - MARKER_LINES;
        let preview = match direction {
            TruncateDirection::Head => cap_bytes_head(&head_lines(output, budget)),
            TruncateDirection::Tail => cap_bytes_tail(&tail_lines(output, budget)),
        };
        let kept_lines = preview.lines().count();
        let omitted_lines = total_lines.saturating_sub(kept_lines);
        let omitted_bytes = output.len().saturating_sub(preview.len());
        let marker = format!("...{omitted_lines} lines truncated ({omitted_bytes} chars)...");
        let hint = format!("Full output saved to {}", spill_path.display());

        let content = match direction {
            TruncateDirection::Head => format!("{preview}\n\n{marker}\n{hint}"),
            TruncateDirection::Tail => format!("{marker}\n\n{preview}\n{hint}"),
        };

        Ok(TruncatedOutput {
            content,
            truncated: true,
            spill: Some(spill_path),
        })
    }

    /// Best-effort removal of spill files older than 7 days, once per
    /// process. Ages come from the id-embedded timestamps.
    fn maybe_gc(&self) {
        if self.gc_done.swap(true, Ordering::Relaxed) {
            return;
        }
        let Ok(entries) = std::fs::read_dir(&self.spill_dir) else {
            return;
        };
        let now = now_millis();
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(created) = quill_core::ids::created_ms(&name.to_string_lossy()) else {
                continue;
            };
            if now.saturating_sub(created) > SPILL_TTL_MS {
                if std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                } else {
                    warn!(file = %entry.path().display(), "spill GC failed to remove file");
                }
            }
        }
        if removed > 0 {
            debug!(removed, "expired tool-output spills removed");
        }
    }
}

fn head_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

fn cap_bytes_head(text: &str) -> String {
    if text.len() <= MAX_BYTES {
        return text.to_string();
    }
    let mut cut = MAX_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

fn cap_bytes_tail(text: &str) -> String {
    if text.len() <= MAX_BYTES {
        return text.to_string();
    }
    let mut cut = text.len() - MAX_BYTES;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text[cut..].to_string()
}
