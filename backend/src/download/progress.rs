//! Parsing of yt-dlp / ffmpeg output lines
//!
//! [`parse_line`] is a pure function: every input, including partial lines,
//! ANSI-coloured output and binary garbage, maps to an [`OutputEvent`].
//! Unrecognised input is [`OutputEvent::Nothing`], never an error.
//! [`ProgressTracker`] holds the only cross-line state, and the caller owns it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;

/// Lines longer than this are not tool status lines
const MAX_LINE_LEN: usize = 8 * 1024;

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[download\]\s+(?P<pct>\d{1,3}(?:[.,]\d+)?)%(?:\s+of\s+(?P<approx>~)?\s*(?P<size>\d+(?:[.,]\d+)?\s*[KMGTP]?i?B))?(?:\s+in\s+(?P<took>[\d:]+))?(?:\s+at\s+(?P<speed>Unknown(?:\s+B/s)?|\d+(?:[.,]\d+)?\s*[KMGTP]?i?B/s))?(?:\s+ETA\s+(?P<eta>Unknown|[\d:]+|--:--))?(?:\s+\(frag\s+(?P<frag>\d+)/(?P<frags>\d+)\))?",
    )
    .expect("progress regex is valid")
});

static DESTINATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+Destination:\s+(?P<path>.+)$").expect("valid"));

static ALREADY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[download\]\s+(?P<path>.+?)\s+has already been downloaded").expect("valid")
});

static MERGER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"(?P<path>.+)"$"#).expect("valid")
});

static EXTRACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[ExtractAudio\]\s+Destination:\s+(?P<path>.+)$").expect("valid")
});

static POSTPROCESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[(?P<stage>Fixup\w*|ffmpeg|VideoConvertor|VideoRemuxer|EmbedThumbnail|EmbedSubtitle|Metadata|ModifyChapters|SponsorBlock|MoveFiles)\]\s*(?P<msg>.*)$",
    )
    .expect("valid")
});

static ERROR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ERROR:\s*(?P<msg>.*)$").expect("valid"));

/// One parsed progress line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    /// Clamped to 0-100
    pub percent: f64,
    pub total_bytes: Option<u64>,
    /// Total was prefixed with `~`
    pub estimated_total: bool,
    /// Bytes per second
    pub speed: Option<u64>,
    /// Seconds remaining
    pub eta: Option<u64>,
    /// Current and total fragment for segmented streams
    pub fragment: Option<(u32, u32)>,
}

/// Non-progress notices that matter to the item
#[derive(Debug, Clone, PartialEq)]
pub enum InfoEvent {
    /// A new file is being downloaded; starts a new phase
    Destination(PathBuf),
    /// Separate streams are being merged into the final file
    Merging(PathBuf),
    /// Audio is being extracted into the final file
    ExtractingAudio(PathBuf),
    PostProcessing { stage: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Progress(ProgressSample),
    Info(InfoEvent),
    /// The tool reports the work is already done
    Finished(Option<PathBuf>),
    /// The tool reports why it is failing
    Failure(String),
    Nothing,
}

/// Classify one line of tool output
pub fn parse_line(raw: &str) -> OutputEvent {
    if raw.len() > MAX_LINE_LEN {
        return OutputEvent::Nothing;
    }

    let cleaned = strip_ansi_escapes::strip_str(raw);
    let line = cleaned.trim();
    if line.is_empty() {
        return OutputEvent::Nothing;
    }

    if let Some(caps) = ERROR_RE.captures(line) {
        return OutputEvent::Failure(caps["msg"].trim().to_string());
    }

    if let Some(caps) = DESTINATION_RE.captures(line) {
        return OutputEvent::Info(InfoEvent::Destination(PathBuf::from(caps["path"].trim())));
    }

    if let Some(caps) = ALREADY_RE.captures(line) {
        return OutputEvent::Finished(Some(PathBuf::from(caps["path"].trim())));
    }

    if let Some(caps) = PROGRESS_RE.captures(line) {
        let Some(percent) = parse_number(&caps["pct"]) else {
            return OutputEvent::Nothing;
        };
        let took = caps.name("took").is_some();
        return OutputEvent::Progress(ProgressSample {
            percent: percent.clamp(0.0, 100.0),
            total_bytes: caps.name("size").and_then(|m| parse_size(m.as_str())),
            estimated_total: caps.name("approx").is_some() && !took,
            speed: caps.name("speed").and_then(|m| parse_speed(m.as_str())),
            eta: if took {
                Some(0)
            } else {
                caps.name("eta").and_then(|m| parse_duration(m.as_str()))
            },
            fragment: match (caps.name("frag"), caps.name("frags")) {
                (Some(a), Some(b)) => a.as_str().parse().ok().zip(b.as_str().parse().ok()),
                _ => None,
            },
        });
    }

    if let Some(caps) = MERGER_RE.captures(line) {
        return OutputEvent::Info(InfoEvent::Merging(PathBuf::from(&caps["path"])));
    }

    if let Some(caps) = EXTRACT_RE.captures(line) {
        return OutputEvent::Info(InfoEvent::ExtractingAudio(PathBuf::from(caps["path"].trim())));
    }

    if let Some(caps) = POSTPROCESS_RE.captures(line) {
        return OutputEvent::Info(InfoEvent::PostProcessing {
            stage: caps["stage"].to_string(),
            message: caps["msg"].trim().to_string(),
        });
    }

    OutputEvent::Nothing
}

/// Parse a decimal that may use a comma separator
fn parse_number(s: &str) -> Option<f64> {
    let value: f64 = s.trim().replace(',', ".").parse().ok()?;
    value.is_finite().then_some(value)
}

/// `10.50MiB`, `512KiB`, `1.2 GB` into bytes
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let value = parse_number(&s[..split])?;
    let multiplier: f64 = match s[split..].trim() {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

fn parse_speed(s: &str) -> Option<u64> {
    parse_size(s.trim().strip_suffix("/s")?)
}

/// `07`, `00:07`, `01:02:03` into seconds
pub fn parse_duration(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    s.split(':').try_fold(0u64, |acc, part| {
        let part: u64 = part.parse().ok()?;
        acc.checked_mul(60)?.checked_add(part)
    })
}

/// Keeps the reported percent monotonic across noise and phases.
///
/// yt-dlp downloads separate video and audio streams one after the other,
/// each reporting 0-100%. A drop inside one phase is noise and is ignored;
/// a drop after a new `Destination` starts a new phase, which may update
/// speed and ETA but never pulls the reported percent back.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    phase: u32,
    last_in_phase: Option<f64>,
    reported: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from what the item already shows, e.g. after a resume
    pub fn resuming(from: f64) -> Self {
        Self {
            reported: from.clamp(0.0, 100.0),
            ..Self::default()
        }
    }

    pub fn start_phase(&mut self) {
        self.phase += 1;
        self.last_in_phase = None;
    }

    /// Feed a parsed percent. Returns the value to report when it moves the
    /// bar forward, `None` otherwise.
    pub fn observe(&mut self, percent: f64) -> Option<f64> {
        if !percent.is_finite() {
            return None;
        }
        let percent = percent.clamp(0.0, 100.0);

        if let Some(last) = self.last_in_phase {
            if percent < last {
                return None;
            }
        }
        self.last_in_phase = Some(percent);

        if percent > self.reported {
            self.reported = percent;
            Some(percent)
        } else {
            None
        }
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    pub fn reported(&self) -> f64 {
        self.reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(line: &str) -> ProgressSample {
        match parse_line(line) {
            OutputEvent::Progress(sample) => sample,
            other => panic!("expected progress for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn parses_typical_progress_line() {
        let sample = progress("[download]  45.3% of   10.50MiB at    1.25MiB/s ETA 00:07");
        assert_eq!(sample.percent, 45.3);
        assert_eq!(sample.total_bytes, Some(11_010_048));
        assert!(!sample.estimated_total);
        assert_eq!(sample.speed, Some(1_310_720));
        assert_eq!(sample.eta, Some(7));
        assert_eq!(sample.fragment, None);
    }

    #[test]
    fn parses_estimated_fragmented_progress() {
        let sample =
            progress("[download]   3.1% of ~ 120.00MiB at  800.00KiB/s ETA 02:31 (frag 4/130)");
        assert!(sample.estimated_total);
        assert_eq!(sample.speed, Some(819_200));
        assert_eq!(sample.eta, Some(151));
        assert_eq!(sample.fragment, Some((4, 130)));
    }

    #[test]
    fn unknown_speed_and_eta_are_none() {
        let sample = progress("[download]   0.0% of    3.00MiB at  Unknown B/s ETA Unknown");
        assert_eq!(sample.percent, 0.0);
        assert_eq!(sample.speed, None);
        assert_eq!(sample.eta, None);
    }

    #[test]
    fn comma_decimals_are_accepted() {
        let sample = progress("[download]  12,5% of 2,00MiB at 1,00MiB/s ETA 00:01");
        assert_eq!(sample.percent, 12.5);
        assert_eq!(sample.total_bytes, Some(2 * 1024 * 1024));
    }

    #[test]
    fn completion_line_has_exact_size() {
        let sample = progress("[download] 100% of ~  10.00MiB in 00:00:08 at 1.20MiB/s");
        assert_eq!(sample.percent, 100.0);
        assert!(!sample.estimated_total);
        assert_eq!(sample.eta, Some(0));
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(progress("[download] 250% of 1.00MiB").percent, 100.0);
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        let sample = progress(
            "\u{1b}[0;94m[download]\u{1b}[0m \u{1b}[0;32m 50.0%\u{1b}[0m of 1.00MiB at 1.00MiB/s ETA 00:01",
        );
        assert_eq!(sample.percent, 50.0);
    }

    #[test]
    fn destination_starts_phase() {
        assert_eq!(
            parse_line("[download] Destination: /tmp/clip.f137.mp4"),
            OutputEvent::Info(InfoEvent::Destination(PathBuf::from("/tmp/clip.f137.mp4")))
        );
    }

    #[test]
    fn merge_and_extract_name_final_file() {
        assert_eq!(
            parse_line(r#"[Merger] Merging formats into "/tmp/clip.mp4""#),
            OutputEvent::Info(InfoEvent::Merging(PathBuf::from("/tmp/clip.mp4")))
        );
        assert_eq!(
            parse_line("[ExtractAudio] Destination: /tmp/clip.mp3"),
            OutputEvent::Info(InfoEvent::ExtractingAudio(PathBuf::from("/tmp/clip.mp3")))
        );
    }

    #[test]
    fn postprocessing_notice() {
        assert_eq!(
            parse_line("[FixupM3u8] Fixing MPEG-TS in MP4 container of \"a.mp4\""),
            OutputEvent::Info(InfoEvent::PostProcessing {
                stage: "FixupM3u8".to_string(),
                message: "Fixing MPEG-TS in MP4 container of \"a.mp4\"".to_string(),
            })
        );
    }

    #[test]
    fn already_downloaded_is_terminal_success() {
        assert_eq!(
            parse_line("[download] /tmp/clip.mp4 has already been downloaded"),
            OutputEvent::Finished(Some(PathBuf::from("/tmp/clip.mp4")))
        );
    }

    #[test]
    fn error_lines_carry_reason() {
        assert_eq!(
            parse_line("ERROR: [youtube] abc: Video unavailable"),
            OutputEvent::Failure("[youtube] abc: Video unavailable".to_string())
        );
    }

    #[test]
    fn junk_is_nothing() {
        for line in [
            "",
            "   ",
            "[youtube] abc: Downloading webpage",
            "[download]",
            "[download] %",
            "100%",
            "\u{0}\u{1}\u{fffd}\u{fffd}garbage\u{7f}",
            "[download] 99999999999999999999999999999% of 1MiB",
        ] {
            assert_eq!(parse_line(line), OutputEvent::Nothing, "line {line:?}");
        }
        assert_eq!(parse_line(&"x".repeat(MAX_LINE_LEN + 1)), OutputEvent::Nothing);
    }

    #[test]
    fn sizes_and_durations() {
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("1.5KiB"), Some(1536));
        assert_eq!(parse_size("2 MB"), Some(2_000_000));
        assert_eq!(parse_size("3XB"), None);
        assert_eq!(parse_duration("07"), Some(7));
        assert_eq!(parse_duration("01:02:03"), Some(3723));
        assert_eq!(parse_duration("--:--"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn tracker_ignores_noise_within_phase() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe(10.0), Some(10.0));
        assert_eq!(tracker.observe(40.0), Some(40.0));
        assert_eq!(tracker.observe(5.0), None);
        assert_eq!(tracker.observe(45.0), Some(45.0));
        assert_eq!(tracker.reported(), 45.0);
    }

    #[test]
    fn tracker_never_regresses_across_phases() {
        let mut tracker = ProgressTracker::new();
        tracker.start_phase();
        tracker.observe(100.0);
        tracker.start_phase();
        assert_eq!(tracker.phase(), 2);
        assert_eq!(tracker.observe(3.0), None);
        assert_eq!(tracker.observe(60.0), None);
        assert_eq!(tracker.reported(), 100.0);
    }

    #[test]
    fn tracker_resumes_from_previous_value() {
        let mut tracker = ProgressTracker::resuming(30.0);
        assert_eq!(tracker.observe(0.0), None);
        assert_eq!(tracker.observe(31.0), Some(31.0));
        assert_eq!(tracker.observe(f64::NAN), None);
    }
}
