//! Building the yt-dlp command line for an item

use crate::config::ToolSettings;
use crate::download::item::{FormatSelection, MediaKind};
use crate::process::CommandSpec;
use std::path::{Component, Path};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("url is empty")]
    EmptyUrl,

    #[error("output template must stay inside the destination: {0}")]
    EscapingTemplate(String),

    #[error("invalid format selection: {0}")]
    InvalidFormat(String),
}

/// What the executor knows about an item when it needs a command line
#[derive(Debug, Clone, Copy)]
pub struct InvocationRequest<'a> {
    pub url: &'a str,
    pub format: Option<&'a FormatSelection>,
    pub output_dir: &'a Path,
    pub output_template: &'a str,
}

/// Turns an item into a ready argument vector. Implementations must not
/// rely on a shell; the result is executed verbatim.
pub trait InvocationBuilder: Send + Sync {
    fn build(&self, request: &InvocationRequest<'_>) -> Result<CommandSpec, InvocationError>;
}

/// Default builder targeting yt-dlp
#[derive(Debug, Clone, Default)]
pub struct YtDlpInvocation {
    tools: ToolSettings,
}

/// True when `template` could resolve outside the directory it is joined
/// to: absolute paths, drive prefixes and any `..` component.
pub fn template_escapes(template: &str) -> bool {
    Path::new(template)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
}

impl YtDlpInvocation {
    pub fn new(tools: ToolSettings) -> Self {
        Self { tools }
    }
}

impl InvocationBuilder for YtDlpInvocation {
    fn build(&self, request: &InvocationRequest<'_>) -> Result<CommandSpec, InvocationError> {
        let url = request.url.trim();
        if url.is_empty() {
            return Err(InvocationError::EmptyUrl);
        }
        if template_escapes(request.output_template) {
            return Err(InvocationError::EscapingTemplate(
                request.output_template.to_string(),
            ));
        }

        let mut spec = CommandSpec::new(&self.tools.ytdlp_path)
            .args(["--newline", "--progress", "--no-colors"])
            .arg("--paths")
            .arg(request.output_dir.to_string_lossy())
            .arg("--output")
            .arg(request.output_template)
            // Progress must not be buffered when stdout is a pipe.
            .env("PYTHONUNBUFFERED", "1");

        if let Some(format) = request.format {
            spec = spec.args(format_args(format)?);
        }

        if let Some(ffmpeg) = &self.tools.ffmpeg_path {
            spec = spec
                .arg("--ffmpeg-location")
                .arg(ffmpeg.to_string_lossy());
        }

        Ok(spec
            .args(self.tools.extra_args.iter().cloned())
            .arg("--")
            .arg(url))
    }
}

fn format_args(format: &FormatSelection) -> Result<Vec<String>, InvocationError> {
    let mut args = Vec::new();

    if let Some(id) = &format.format_id {
        if id.is_empty() || id.starts_with('-') || id.chars().any(char::is_whitespace) {
            return Err(InvocationError::InvalidFormat(id.clone()));
        }
    }
    if let Some(container) = &format.container {
        if container.is_empty() || !container.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvocationError::InvalidFormat(container.clone()));
        }
    }

    match format.kind {
        MediaKind::Video => {
            let selector = match (&format.format_id, format.max_height) {
                (Some(id), _) => Some(id.clone()),
                (None, Some(h)) => Some(format!(
                    "bestvideo[height<={h}]+bestaudio/best[height<={h}]"
                )),
                (None, None) => None,
            };
            if let Some(selector) = selector {
                args.push("--format".to_string());
                args.push(selector);
            }
            if let Some(container) = &format.container {
                args.push("--merge-output-format".to_string());
                args.push(container.clone());
            }
        }
        MediaKind::Audio => {
            args.push("--format".to_string());
            args.push(
                format
                    .format_id
                    .clone()
                    .unwrap_or_else(|| "bestaudio/best".to_string()),
            );
            args.push("--extract-audio".to_string());
            if let Some(codec) = &format.container {
                args.push("--audio-format".to_string());
                args.push(codec.clone());
            }
        }
    }

    Ok(args)
}
