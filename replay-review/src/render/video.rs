//! ffprobe / ffmpeg post-processing of rendered videos.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::{debug, error, info};

use crate::config::RenderConfig;
use crate::{Error, Result};

/// Black segments starting later than this are not an intro.
const INTRO_START_TOLERANCE_SECS: f64 = 0.05;
/// Intros this short are left alone.
const MIN_INTRO_SECS: f64 = 0.1;
/// Longer black openings are likely content and are kept.
const MAX_INTRO_SECS: f64 = 10.0;

/// A black span reported by `blackdetect`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlackSegment {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

impl BlackSegment {
    /// Whether this span is a leading black intro worth trimming.
    pub fn is_trimmable_intro(&self) -> bool {
        self.start <= INTRO_START_TOLERANCE_SECS
            && self.duration > MIN_INTRO_SECS
            && self.duration <= MAX_INTRO_SECS
    }
}

/// Parse `blackdetect` lines from ffmpeg stderr.
///
/// ```text
/// [blackdetect @ 0x55d1c2] black_start:0 black_end:2.04 black_duration:2.04
/// ```
pub fn parse_blackdetect(stderr: &str) -> Vec<BlackSegment> {
    stderr
        .lines()
        .filter(|line| line.contains("black_start:"))
        .filter_map(|line| {
            let field = |key: &str| -> Option<f64> {
                let rest = &line[line.find(key)? + key.len()..];
                rest.split_whitespace().next()?.parse().ok()
            };
            let start = field("black_start:")?;
            let end = field("black_end:")?;
            let duration = field("black_duration:").unwrap_or(end - start);
            Some(BlackSegment {
                start,
                end,
                duration,
            })
        })
        .collect()
}

/// Pick the intro to trim, if the first black span qualifies.
pub fn intro_to_trim(segments: &[BlackSegment]) -> Option<BlackSegment> {
    segments.first().copied().filter(BlackSegment::is_trimmable_intro)
}

/// Thin wrapper over the ffmpeg / ffprobe binaries.
#[derive(Debug, Clone)]
pub struct VideoTools {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl VideoTools {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(&config.ffmpeg_path, &config.ffprobe_path)
    }

    /// Container duration in seconds.
    pub async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = process_utils::tokio_command(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::render(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("ffprobe failed: {}", stderr);
            return Err(Error::render(format!("ffprobe failed: {}", stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::render(format!("unexpected ffprobe duration: {:?}", stdout.trim())))
    }

    /// Run `blackdetect` over the video.
    pub async fn detect_black(&self, path: &Path) -> Result<Vec<BlackSegment>> {
        let output = process_utils::tokio_command(&self.ffmpeg_path)
            .args(["-hide_banner", "-nostats", "-i"])
            .arg(path)
            .args(["-vf", "blackdetect=d=0.1:pix_th=0.10", "-an", "-f", "null", "-"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::render(format!("failed to run ffmpeg blackdetect: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            error!("ffmpeg blackdetect failed: {}", stderr);
            return Err(Error::render("ffmpeg blackdetect failed"));
        }
        Ok(parse_blackdetect(&stderr))
    }

    /// Cut everything before `from_secs` into `output`.
    pub async fn trim_start(&self, input: &Path, output: &Path, from_secs: f64) -> Result<()> {
        let result = process_utils::tokio_command(&self.ffmpeg_path)
            .args(["-hide_banner", "-y", "-ss"])
            .arg(format!("{from_secs:.3}"))
            .arg("-i")
            .arg(input)
            .args([
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
                "-an",
            ])
            .arg(output)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::render(format!("failed to run ffmpeg trim: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            error!("ffmpeg trim failed: {}", stderr);
            return Err(Error::render("ffmpeg trim failed"));
        }
        debug!("ffmpeg output: {}", String::from_utf8_lossy(&result.stderr));
        Ok(())
    }

    /// Trim a leading black intro if there is one. Returns the path of the
    /// video to keep (the original when nothing was trimmed).
    pub async fn trim_black_intro(&self, input: &Path) -> Result<PathBuf> {
        let segments = self.detect_black(input).await?;
        let Some(intro) = intro_to_trim(&segments) else {
            debug!(path = %input.display(), "No black intro to trim");
            return Ok(input.to_path_buf());
        };

        let trimmed = input.with_file_name(format!(
            "{}.trimmed.mp4",
            input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        self.trim_start(input, &trimmed, intro.end).await?;
        info!(
            path = %input.display(),
            trimmed_secs = intro.duration,
            "Trimmed black intro"
        );
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn black(start: f64, duration: f64) -> BlackSegment {
        BlackSegment {
            start,
            end: start + duration,
            duration,
        }
    }

    #[test]
    fn test_parse_blackdetect() {
        let stderr = "\
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'a.mp4':
[blackdetect @ 0x55d1c2a0] black_start:0 black_end:2.04 black_duration:2.04
frame=  250 fps=0.0 q=-0.0 size=N/A
[blackdetect @ 0x55d1c2a0] black_start:40.5 black_end:41 black_duration:0.5
";
        let segments = parse_blackdetect(stderr);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], black(0.0, 2.04));
        assert_eq!(segments[1].start, 40.5);
        assert!(parse_blackdetect("nothing here").is_empty());
    }

    #[test]
    fn test_intro_window() {
        assert!(black(0.0, 2.0).is_trimmable_intro());
        assert!(black(0.05, 10.0).is_trimmable_intro());
        assert!(!black(0.0, 0.1).is_trimmable_intro());
        assert!(!black(0.0, 10.5).is_trimmable_intro());
        assert!(!black(0.06, 1.0).is_trimmable_intro());
    }

    #[test]
    fn test_only_first_segment_counts() {
        assert_eq!(intro_to_trim(&[]), None);
        assert_eq!(intro_to_trim(&[black(3.0, 1.0), black(0.0, 1.0)]), None);
        assert_eq!(intro_to_trim(&[black(0.0, 1.5)]), Some(black(0.0, 1.5)));
    }
}
