//! Size-constrained video compression
//!
//! Some platforms cap uploads far below the general envelope. The
//! compressor iterates up to three encode attempts with a progressively
//! more aggressive parameter schedule until the result fits the byte
//! budget. The schedule is an explicit table keyed by attempt index so the
//! ladder is testable on its own.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{MediaError, Result};
use crate::media::probe::{self, VideoProperties};
use crate::media::store::{sibling_key, MediaStore};

pub const MAX_ATTEMPTS: usize = 3;
/// Target bitrates never drop below this, whatever the budget says.
pub const MIN_BITRATE_MBPS: f64 = 0.5;

/// Encoding parameters for one ladder attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptParams {
    /// Fraction of the byte budget the encode aims for
    pub size_ratio: f64,
    pub preset: &'static str,
    pub profile: &'static str,
    pub crf_cap: Option<u32>,
    pub audio_bitrate_kbps: u32,
}

/// The parameter schedule for attempt `index` (0-based).
pub fn attempt_params(index: usize) -> AttemptParams {
    match index {
        0 => AttemptParams {
            size_ratio: 0.9,
            preset: "fast",
            profile: "high",
            crf_cap: None,
            audio_bitrate_kbps: 128,
        },
        1 => AttemptParams {
            size_ratio: 0.8,
            preset: "medium",
            profile: "main",
            crf_cap: Some(28),
            audio_bitrate_kbps: 96,
        },
        _ => AttemptParams {
            size_ratio: 0.7,
            preset: "slow",
            profile: "main",
            crf_cap: Some(32),
            audio_bitrate_kbps: 64,
        },
    }
}

/// Bitrate in Mbps that fills `target_size_bytes` over `duration_secs`,
/// floored at [`MIN_BITRATE_MBPS`].
pub fn target_bitrate_mbps(target_size_bytes: u64, duration_secs: f64) -> f64 {
    if duration_secs <= 0.0 {
        return MIN_BITRATE_MBPS;
    }
    let mbps = target_size_bytes as f64 * 8.0 / duration_secs / 1_000_000.0;
    mbps.max(MIN_BITRATE_MBPS)
}

/// Build the ffmpeg argument list for one compression attempt.
pub fn build_attempt_args(
    input: &str,
    output: &str,
    params: &AttemptParams,
    bitrate_mbps: f64,
    has_audio: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        input.into(),
        "-c:v".into(),
        "libx264".into(),
        "-b:v".into(),
        format!("{:.2}M", bitrate_mbps),
        "-maxrate".into(),
        format!("{:.2}M", bitrate_mbps),
        "-bufsize".into(),
        format!("{:.2}M", bitrate_mbps * 2.0),
        "-preset".into(),
        params.preset.into(),
        "-profile:v".into(),
        params.profile.into(),
    ];

    if let Some(crf) = params.crf_cap {
        args.extend(["-crf".into(), format!("{}", crf)]);
    }

    if has_audio {
        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", params.audio_bitrate_kbps),
        ]);
    } else {
        args.push("-an".into());
    }

    args.extend(["-movflags".into(), "+faststart".into(), output.into()]);
    args
}

/// Compressor bound to a media store
pub struct SizeConstrainedCompressor {
    store: Arc<dyn MediaStore>,
}

impl SizeConstrainedCompressor {
    pub fn new(store: Arc<dyn MediaStore>) -> Self {
        Self { store }
    }

    /// Compress the video behind `url` until it fits `max_size_bytes`.
    ///
    /// Returns the original URL unchanged when already within budget,
    /// otherwise uploads the first fitting encode under a sibling key and
    /// returns the new URL. When all attempts still exceed the budget the
    /// smallest achieved encode is uploaded anyway and the overage logged.
    pub async fn compress(&self, url: &str, max_size_bytes: u64) -> Result<String> {
        let current_size = self.store.size_of(url).await?;
        if current_size <= max_size_bytes {
            return Ok(url.to_string());
        }

        let fetched = self.store.fetch(url).await?;
        let props = probe::probe_file(fetched.path()).await?;

        let mut best: Option<(tempfile::NamedTempFile, u64, usize)> = None;

        for index in 0..MAX_ATTEMPTS {
            let params = attempt_params(index);
            let target_size = (max_size_bytes as f64 * params.size_ratio) as u64;
            let bitrate = target_bitrate_mbps(target_size, props.duration_secs);

            info!(
                url,
                attempt = index + 1,
                bitrate_mbps = bitrate,
                preset = params.preset,
                "compression attempt"
            );

            let output = tempfile::Builder::new()
                .suffix(".mp4")
                .tempfile()
                .map_err(MediaError::Io)?;

            let args = build_attempt_args(
                &fetched.path().to_string_lossy(),
                &output.path().to_string_lossy(),
                &params,
                bitrate,
                props.has_audio(),
            );
            probe::run_ffmpeg(&args).await?;

            let encoded_size = tokio::fs::metadata(output.path())
                .await
                .map_err(MediaError::Io)?
                .len();

            if encoded_size <= max_size_bytes {
                return self.upload_result(url, output.path(), index).await;
            }

            if best.as_ref().is_none_or(|(_, size, _)| encoded_size < *size) {
                best = Some((output, encoded_size, index));
            }
        }

        // Budget never met: ship the smallest achieved encode anyway
        let (output, size, index) = best.ok_or_else(|| {
            MediaError::Encode("no compression attempt produced output".to_string())
        })?;
        warn!(
            url,
            achieved = size,
            budget = max_size_bytes,
            overage = size - max_size_bytes,
            "compression budget not met after all attempts, returning best effort"
        );
        self.upload_result(url, output.path(), index).await
    }

    async fn upload_result(
        &self,
        original_url: &str,
        path: &std::path::Path,
        attempt_index: usize,
    ) -> Result<String> {
        let key = self.store.key_of(original_url)?;
        let new_key = sibling_key(&key, &format!("fit{}", attempt_index + 1));
        self.store.put(&new_key, path, "video/mp4").await
    }
}

/// The byte size the compressor aims for on a given attempt.
pub fn attempt_target_size(max_size_bytes: u64, index: usize) -> u64 {
    (max_size_bytes as f64 * attempt_params(index).size_ratio) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::store::LocalStore;

    #[test]
    fn test_schedule_gets_progressively_more_aggressive() {
        let first = attempt_params(0);
        let second = attempt_params(1);
        let third = attempt_params(2);

        assert_eq!(first.size_ratio, 0.9);
        assert_eq!(second.size_ratio, 0.8);
        assert_eq!(third.size_ratio, 0.7);

        assert_eq!(first.preset, "fast");
        assert_eq!(second.preset, "medium");
        assert_eq!(third.preset, "slow");

        // Profile downgrades after the first attempt
        assert_eq!(first.profile, "high");
        assert_eq!(second.profile, "main");
        assert_eq!(third.profile, "main");

        // CRF ceiling layers on for attempts 2-3
        assert_eq!(first.crf_cap, None);
        assert_eq!(second.crf_cap, Some(28));
        assert_eq!(third.crf_cap, Some(32));

        assert_eq!(first.audio_bitrate_kbps, 128);
        assert_eq!(second.audio_bitrate_kbps, 96);
        assert_eq!(third.audio_bitrate_kbps, 64);
    }

    #[test]
    fn test_target_bitrate_floor() {
        // A tiny budget over a long duration still gets the floor
        assert_eq!(target_bitrate_mbps(1_000, 3_600.0), MIN_BITRATE_MBPS);
        assert_eq!(target_bitrate_mbps(1_000_000, 0.0), MIN_BITRATE_MBPS);
    }

    #[test]
    fn test_target_bitrate_math() {
        // 60 MB over 60s = 8 Mbps
        let mbps = target_bitrate_mbps(60_000_000, 60.0);
        assert!((mbps - 8.0).abs() < 0.001);
    }

    #[test]
    fn test_attempt_target_size() {
        assert_eq!(attempt_target_size(100_000_000, 0), 90_000_000);
        assert_eq!(attempt_target_size(100_000_000, 1), 80_000_000);
        assert_eq!(attempt_target_size(100_000_000, 2), 70_000_000);
    }

    #[test]
    fn test_build_attempt_args_audio_drop() {
        let params = attempt_params(2);
        let args = build_attempt_args("in.mp4", "out.mp4", &params, 1.5, false);
        assert!(args.contains(&"-an".to_string()));
        assert!(args.contains(&"slow".to_string()));
        assert!(args.contains(&"32".to_string()));

        let args = build_attempt_args("in.mp4", "out.mp4", &params, 1.5, true);
        assert!(args.contains(&"64k".to_string()));
    }

    #[tokio::test]
    async fn test_compress_within_budget_is_identity() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(root.path().to_path_buf()));

        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), vec![0_u8; 1_000]).unwrap();
        let url = store.put("small.mp4", source.path(), "video/mp4").await.unwrap();

        let compressor = SizeConstrainedCompressor::new(store);
        let result = compressor.compress(&url, 10_000).await.unwrap();

        // Already within budget: same URL back, no re-encode
        assert_eq!(result, url);
    }
}
