//! ffprobe/ffmpeg process invocation and stream property parsing

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{MediaError, Result};

/// Properties of a video file relevant to the normalization envelope
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProperties {
    pub container: String,
    pub video_codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_secs: f64,
    pub bitrate_bps: u64,
    pub size_bytes: u64,
    pub audio: Option<AudioProperties>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioProperties {
    pub codec: String,
    pub channels: u32,
    pub sample_rate: u32,
    pub bitrate_bps: Option<u64>,
}

impl VideoProperties {
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

/// Probe a local video file with ffprobe.
pub async fn probe_file(path: &Path) -> Result<VideoProperties> {
    let size_bytes = tokio::fs::metadata(path).await.map_err(MediaError::Io)?.len();

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| MediaError::Probe(format!("failed to spawn ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(MediaError::Probe(format!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ))
        .into());
    }

    let json = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_json(&json, size_bytes)
}

/// Run ffmpeg with the given arguments, surfacing stderr on failure.
pub async fn run_ffmpeg(args: &[String]) -> Result<()> {
    debug!(?args, "running ffmpeg");

    let output = Command::new("ffmpeg")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| MediaError::Encode(format!("failed to spawn ffmpeg: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // The tail of ffmpeg's stderr carries the actual failure
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(MediaError::Encode(format!(
            "ffmpeg exited with {}: {}",
            output.status, tail
        ))
        .into());
    }

    Ok(())
}

#[derive(Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    format_name: String,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    bit_rate: Option<String>,
}

/// Parse ffprobe's JSON output into [`VideoProperties`].
pub fn parse_ffprobe_json(json: &str, size_bytes: u64) -> Result<VideoProperties> {
    let parsed: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| MediaError::Probe(format!("unreadable ffprobe output: {}", e)))?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| MediaError::Probe("no video stream".to_string()))?;

    let audio = parsed
        .streams
        .iter()
        .find(|s| s.codec_type == "audio")
        .map(|s| AudioProperties {
            codec: s.codec_name.clone().unwrap_or_default(),
            channels: s.channels.unwrap_or(0),
            sample_rate: s
                .sample_rate
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            bitrate_bps: s.bit_rate.as_deref().and_then(|v| v.parse().ok()),
        });

    let duration_secs: f64 = parsed
        .format
        .duration
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);

    let bitrate_bps: u64 = parsed
        .format
        .bit_rate
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| {
            if duration_secs > 0.0 {
                (size_bytes as f64 * 8.0 / duration_secs) as u64
            } else {
                0
            }
        });

    Ok(VideoProperties {
        container: parsed.format.format_name,
        video_codec: video.codec_name.clone().unwrap_or_default(),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps: video
            .r_frame_rate
            .as_deref()
            .map(parse_frame_rate)
            .unwrap_or(0.0),
        duration_secs,
        bitrate_bps,
        size_bytes,
        audio,
    })
}

/// Parse an ffprobe rational frame rate such as `30000/1001`.
fn parse_frame_rate(value: &str) -> f64 {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(1.0);
            if den == 0.0 {
                0.0
            } else {
                num / den
            }
        }
        None => value.parse().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "codec_type": "video",
                "codec_name": "h264",
                "width": 1920,
                "height": 1080,
                "r_frame_rate": "30000/1001"
            },
            {
                "codec_type": "audio",
                "codec_name": "aac",
                "channels": 2,
                "sample_rate": "48000",
                "bit_rate": "128000"
            }
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "120.5",
            "bit_rate": "8000000"
        }
    }"#;

    #[test]
    fn test_parse_ffprobe_json() {
        let props = parse_ffprobe_json(SAMPLE, 120_500_000).unwrap();

        assert_eq!(props.video_codec, "h264");
        assert_eq!(props.width, 1920);
        assert_eq!(props.height, 1080);
        assert!((props.fps - 29.97).abs() < 0.01);
        assert!((props.duration_secs - 120.5).abs() < f64::EPSILON);
        assert_eq!(props.bitrate_bps, 8_000_000);
        assert_eq!(props.size_bytes, 120_500_000);

        let audio = props.audio.unwrap();
        assert_eq!(audio.codec, "aac");
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.bitrate_bps, Some(128_000));
    }

    #[test]
    fn test_parse_without_audio_stream() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "hevc", "width": 1080,
                 "height": 1920, "r_frame_rate": "60/1"}
            ],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "10.0"}
        }"#;

        let props = parse_ffprobe_json(json, 10_000_000).unwrap();
        assert!(!props.has_audio());
        assert_eq!(props.fps, 60.0);
        // Missing format bitrate falls back to size/duration
        assert_eq!(props.bitrate_bps, 8_000_000);
    }

    #[test]
    fn test_parse_rejects_audio_only_file() {
        let json = r#"{
            "streams": [{"codec_type": "audio", "codec_name": "mp3"}],
            "format": {"format_name": "mp3", "duration": "180.0"}
        }"#;

        assert!(parse_ffprobe_json(json, 1_000).is_err());
    }

    #[test]
    fn test_parse_frame_rate_forms() {
        assert_eq!(parse_frame_rate("24/1"), 24.0);
        assert!((parse_frame_rate("30000/1001") - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), 25.0);
        assert_eq!(parse_frame_rate("0/0"), 0.0);
        assert_eq!(parse_frame_rate("garbage"), 0.0);
    }
}
