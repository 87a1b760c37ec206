//! Video normalization
//!
//! Brings a localized video into the envelope every destination platform
//! accepts, re-encoding only when at least one constraint is violated. The
//! result is written back over the original storage location, so the data
//! model needs no new media row.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::media::probe::{self, VideoProperties};
use crate::media::store::MediaStore;

pub const MAX_BITRATE_BPS: u64 = 25_000_000;
pub const MAX_SIZE_BYTES: u64 = 300 * 1024 * 1024;
/// Re-encode target for oversize sources; leaves headroom under the cap.
pub const OVERSIZE_TARGET_BYTES: u64 = 280 * 1024 * 1024;
pub const OVERSIZE_BITRATE_CAP_BPS: u64 = 15_000_000;
pub const HIGH_BITRATE_TARGET_BPS: u64 = 24_000_000;
pub const MIN_FPS: f64 = 23.0;
pub const MAX_FPS: f64 = 60.0;
pub const DEFAULT_FPS: f64 = 24.0;
pub const AUDIO_MAX_BITRATE_BPS: u64 = 160_000;

/// Aspect-ratio classes and their maximum dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectClass {
    /// 9:16, up to 1080x1920
    Vertical,
    /// 16:9, up to 1920x1080
    Landscape,
    /// 1:1, up to 1080x1080
    Square,
    /// 4:3, up to 1440x1080
    Classic,
}

impl AspectClass {
    pub fn ratio(&self) -> f64 {
        match self {
            AspectClass::Vertical => 9.0 / 16.0,
            AspectClass::Landscape => 16.0 / 9.0,
            AspectClass::Square => 1.0,
            AspectClass::Classic => 4.0 / 3.0,
        }
    }

    pub fn max_dimensions(&self) -> (u32, u32) {
        match self {
            AspectClass::Vertical => (1080, 1920),
            AspectClass::Landscape => (1920, 1080),
            AspectClass::Square => (1080, 1080),
            AspectClass::Classic => (1440, 1080),
        }
    }
}

/// Classify dimensions into the closest aspect class.
///
/// Matches within a ±0.1 ratio tolerance; anything further from every class
/// defaults to landscape.
pub fn classify_aspect(width: u32, height: u32) -> AspectClass {
    if height == 0 {
        return AspectClass::Landscape;
    }
    let ratio = width as f64 / height as f64;

    let classes = [
        AspectClass::Vertical,
        AspectClass::Landscape,
        AspectClass::Square,
        AspectClass::Classic,
    ];

    let mut best = AspectClass::Landscape;
    let mut best_diff = f64::MAX;
    for class in classes {
        let diff = (ratio - class.ratio()).abs();
        if diff < best_diff {
            best = class;
            best_diff = diff;
        }
    }

    if best_diff <= 0.1 {
        best
    } else {
        AspectClass::Landscape
    }
}

/// Uniform downscale bounding both dimensions to the class's max, rounded
/// to even pixel counts. Never upscales.
pub fn scale_dimensions(width: u32, height: u32, class: AspectClass) -> (u32, u32) {
    let (max_w, max_h) = class.max_dimensions();
    let factor = (max_w as f64 / width as f64)
        .min(max_h as f64 / height as f64)
        .min(1.0);

    let even = |v: f64| -> u32 {
        let rounded = v.round() as u32;
        (rounded - rounded % 2).max(2)
    };

    (even(width as f64 * factor), even(height as f64 * factor))
}

/// Force a frame rate into the acceptable range; out-of-range sources drop
/// to the default.
pub fn target_fps(fps: f64) -> f64 {
    if (MIN_FPS..=MAX_FPS).contains(&fps) {
        fps
    } else {
        DEFAULT_FPS
    }
}

/// Whether a video already satisfies every constraint and can skip
/// re-encoding entirely.
pub fn is_compliant(props: &VideoProperties) -> bool {
    if !props.container.split(',').any(|c| c == "mp4") {
        return false;
    }
    if props.video_codec != "h264" && props.video_codec != "hevc" {
        return false;
    }
    if props.bitrate_bps > MAX_BITRATE_BPS {
        return false;
    }
    if props.size_bytes > MAX_SIZE_BYTES {
        return false;
    }
    if !(MIN_FPS..=MAX_FPS).contains(&props.fps) {
        return false;
    }

    let class = classify_aspect(props.width, props.height);
    let (max_w, max_h) = class.max_dimensions();
    if props.width > max_w || props.height > max_h {
        return false;
    }

    if let Some(audio) = &props.audio {
        if audio.codec != "aac"
            || audio.channels > 2
            || audio.sample_rate > 48_000
            || audio.bitrate_bps.is_some_and(|b| b > AUDIO_MAX_BITRATE_BPS)
        {
            return false;
        }
    }

    true
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodeMode {
    /// Bitrate-targeted encode with a named encoder preset
    BitrateTarget { bps: u64, preset: &'static str },
    /// Constant-quality encode
    ConstantQuality { crf: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodePlan {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub mode: EncodeMode,
    pub keep_audio: bool,
}

/// Compute the re-encode plan for a non-compliant video.
pub fn plan_encode(props: &VideoProperties) -> EncodePlan {
    let class = classify_aspect(props.width, props.height);
    let (width, height) = scale_dimensions(props.width, props.height, class);

    let mode = if props.size_bytes > MAX_SIZE_BYTES && props.duration_secs > 0.0 {
        // Target a size comfortably under the cap; faster preset because
        // these encodes run longest
        let bps =
            ((OVERSIZE_TARGET_BYTES as f64 * 8.0 / props.duration_secs) as u64).min(OVERSIZE_BITRATE_CAP_BPS);
        EncodeMode::BitrateTarget { bps, preset: "fast" }
    } else if props.bitrate_bps > MAX_BITRATE_BPS {
        EncodeMode::BitrateTarget {
            bps: HIGH_BITRATE_TARGET_BPS,
            preset: "medium",
        }
    } else {
        EncodeMode::ConstantQuality { crf: 23 }
    };

    EncodePlan {
        width,
        height,
        fps: target_fps(props.fps),
        mode,
        keep_audio: props.has_audio(),
    }
}

/// Build the ffmpeg argument list for a plan.
pub fn build_ffmpeg_args(input: &str, output: &str, plan: &EncodePlan) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        input.into(),
        "-c:v".into(),
        "libx264".into(),
        "-vf".into(),
        format!("scale={}:{}", plan.width, plan.height),
        "-r".into(),
        format!("{}", plan.fps),
    ];

    match &plan.mode {
        EncodeMode::BitrateTarget { bps, preset } => {
            args.extend([
                "-b:v".into(),
                format!("{}", bps),
                "-maxrate".into(),
                format!("{}", bps),
                "-bufsize".into(),
                format!("{}", bps * 2),
                "-preset".into(),
                (*preset).into(),
            ]);
        }
        EncodeMode::ConstantQuality { crf } => {
            args.extend(["-crf".into(), format!("{}", crf), "-preset".into(), "medium".into()]);
        }
    }

    if plan.keep_audio {
        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-ac".into(),
            "2".into(),
            "-ar".into(),
            "48000".into(),
        ]);
    } else {
        args.push("-an".into());
    }

    args.extend(["-movflags".into(), "+faststart".into(), output.into()]);
    args
}

/// Normalizer bound to a media store
pub struct VideoNormalizer {
    store: Arc<dyn MediaStore>,
}

impl VideoNormalizer {
    pub fn new(store: Arc<dyn MediaStore>) -> Self {
        Self { store }
    }

    /// Normalize the video behind a storage URL in place.
    ///
    /// A compliant source is left untouched; otherwise the re-encoded file
    /// overwrites the original object under the same URL.
    pub async fn normalize(&self, url: &str) -> Result<()> {
        let fetched = self.store.fetch(url).await?;
        let props = probe::probe_file(fetched.path()).await?;

        if is_compliant(&props) {
            debug!(url, "video already within envelope, skipping re-encode");
            return Ok(());
        }

        let plan = plan_encode(&props);
        info!(
            url,
            width = plan.width,
            height = plan.height,
            fps = plan.fps,
            ?plan.mode,
            "re-encoding video"
        );

        let output = tempfile::Builder::new()
            .suffix(".mp4")
            .tempfile()
            .map_err(crate::error::MediaError::Io)?;

        let args = build_ffmpeg_args(
            &fetched.path().to_string_lossy(),
            &output.path().to_string_lossy(),
            &plan,
        );
        probe::run_ffmpeg(&args).await?;

        self.store
            .put_over(url, output.path(), "video/mp4")
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::probe::AudioProperties;

    fn compliant_props() -> VideoProperties {
        VideoProperties {
            container: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
            video_codec: "h264".to_string(),
            width: 1920,
            height: 1080,
            fps: 30.0,
            duration_secs: 60.0,
            bitrate_bps: 8_000_000,
            size_bytes: 60_000_000,
            audio: Some(AudioProperties {
                codec: "aac".to_string(),
                channels: 2,
                sample_rate: 48_000,
                bitrate_bps: Some(128_000),
            }),
        }
    }

    #[test]
    fn test_compliant_video_is_a_no_op() {
        assert!(is_compliant(&compliant_props()));
    }

    #[test]
    fn test_each_violated_condition_forces_reencode() {
        let mut p = compliant_props();
        p.container = "matroska,webm".to_string();
        assert!(!is_compliant(&p));

        let mut p = compliant_props();
        p.video_codec = "vp9".to_string();
        assert!(!is_compliant(&p));

        let mut p = compliant_props();
        p.bitrate_bps = 26_000_000;
        assert!(!is_compliant(&p));

        let mut p = compliant_props();
        p.size_bytes = MAX_SIZE_BYTES + 1;
        assert!(!is_compliant(&p));

        let mut p = compliant_props();
        p.fps = 120.0;
        assert!(!is_compliant(&p));

        let mut p = compliant_props();
        p.width = 3840;
        p.height = 2160;
        assert!(!is_compliant(&p));

        let mut p = compliant_props();
        p.audio.as_mut().unwrap().codec = "mp3".to_string();
        assert!(!is_compliant(&p));

        let mut p = compliant_props();
        p.audio.as_mut().unwrap().channels = 6;
        assert!(!is_compliant(&p));
    }

    #[test]
    fn test_hevc_and_audioless_sources_are_compliant() {
        let mut p = compliant_props();
        p.video_codec = "hevc".to_string();
        p.audio = None;
        assert!(is_compliant(&p));
    }

    #[test]
    fn test_classify_aspect() {
        assert_eq!(classify_aspect(1080, 1920), AspectClass::Vertical);
        assert_eq!(classify_aspect(1920, 1080), AspectClass::Landscape);
        assert_eq!(classify_aspect(1080, 1080), AspectClass::Square);
        assert_eq!(classify_aspect(1440, 1080), AspectClass::Classic);

        // Near-matches within tolerance
        assert_eq!(classify_aspect(1088, 1080), AspectClass::Square);

        // Nothing close: default landscape (e.g. ultra-wide)
        assert_eq!(classify_aspect(3440, 1080), AspectClass::Landscape);
    }

    #[test]
    fn test_scale_dimensions_downscale_even() {
        // 4K landscape bounds to 1920x1080
        assert_eq!(
            scale_dimensions(3840, 2160, AspectClass::Landscape),
            (1920, 1080)
        );

        // Odd source dimensions round to even
        let (w, h) = scale_dimensions(1921, 1081, AspectClass::Landscape);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
        assert!(w <= 1920);
        assert!(h <= 1080);
    }

    #[test]
    fn test_scale_dimensions_never_upscales() {
        assert_eq!(
            scale_dimensions(1280, 720, AspectClass::Landscape),
            (1280, 720)
        );
        assert_eq!(
            scale_dimensions(640, 640, AspectClass::Square),
            (640, 640)
        );
    }

    #[test]
    fn test_target_fps() {
        assert_eq!(target_fps(30.0), 30.0);
        assert_eq!(target_fps(23.0), 23.0);
        assert_eq!(target_fps(60.0), 60.0);
        assert_eq!(target_fps(120.0), DEFAULT_FPS);
        assert_eq!(target_fps(15.0), DEFAULT_FPS);
    }

    #[test]
    fn test_plan_oversize_source_targets_280mb() {
        let mut p = compliant_props();
        p.size_bytes = 400 * 1024 * 1024;
        p.duration_secs = 600.0;

        let plan = plan_encode(&p);
        match plan.mode {
            EncodeMode::BitrateTarget { bps, preset } => {
                let expected = (OVERSIZE_TARGET_BYTES as f64 * 8.0 / 600.0) as u64;
                assert_eq!(bps, expected);
                assert!(bps <= OVERSIZE_BITRATE_CAP_BPS);
                assert_eq!(preset, "fast");
            }
            other => panic!("expected bitrate target, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_oversize_short_source_hits_bitrate_cap() {
        let mut p = compliant_props();
        p.size_bytes = 400 * 1024 * 1024;
        p.duration_secs = 30.0;

        let plan = plan_encode(&p);
        match plan.mode {
            EncodeMode::BitrateTarget { bps, .. } => assert_eq!(bps, OVERSIZE_BITRATE_CAP_BPS),
            other => panic!("expected bitrate target, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_high_bitrate_source_uses_fixed_target() {
        let mut p = compliant_props();
        p.bitrate_bps = 30_000_000;

        let plan = plan_encode(&p);
        assert_eq!(
            plan.mode,
            EncodeMode::BitrateTarget {
                bps: HIGH_BITRATE_TARGET_BPS,
                preset: "medium"
            }
        );
    }

    #[test]
    fn test_plan_default_is_constant_quality() {
        let mut p = compliant_props();
        p.video_codec = "vp9".to_string();

        let plan = plan_encode(&p);
        assert_eq!(plan.mode, EncodeMode::ConstantQuality { crf: 23 });
        assert!(plan.keep_audio);
    }

    #[test]
    fn test_build_args_audio_handling() {
        let plan = EncodePlan {
            width: 1920,
            height: 1080,
            fps: 30.0,
            mode: EncodeMode::ConstantQuality { crf: 23 },
            keep_audio: true,
        };
        let args = build_ffmpeg_args("in.mp4", "out.mp4", &plan);
        assert!(args.contains(&"aac".to_string()));
        assert!(args.contains(&"128k".to_string()));
        assert!(args.contains(&"48000".to_string()));

        let plan = EncodePlan {
            keep_audio: false,
            ..plan
        };
        let args = build_ffmpeg_args("in.mp4", "out.mp4", &plan);
        assert!(args.contains(&"-an".to_string()));
        assert!(!args.contains(&"aac".to_string()));
    }
}
