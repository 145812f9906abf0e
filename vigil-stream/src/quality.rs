//! Encoder quality profiles.
//!
//! Quality selection is an opaque knob for callers: a profile carries the
//! scale, bitrate, and encoder preset handed to ffmpeg. All profiles cap the
//! frame rate at 10 fps and force a keyframe every segment so segment
//! boundaries stay clean for playlist rotation.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Playlist file name inside a camera's output directory
pub const MANIFEST_NAME: &str = "playlist.m3u8";

/// Media chunk naming pattern (sequentially numbered)
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";

/// Prefix shared by every media chunk file
pub const SEGMENT_PREFIX: &str = "segment_";

const FRAME_RATE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    /// Grid view: many concurrent streams, fast startup
    #[default]
    Low,
    /// Single-camera view
    Medium,
    /// Fullscreen
    High,
}

impl StreamQuality {
    fn scale(self) -> &'static str {
        match self {
            Self::Low => "640:360",
            Self::Medium => "960:540",
            Self::High => "1280:720",
        }
    }

    fn bitrate(self) -> &'static str {
        match self {
            Self::Low => "200k",
            Self::Medium => "400k",
            Self::High => "800k",
        }
    }

    fn preset(self) -> &'static str {
        match self {
            Self::Low => "p2",
            Self::Medium => "p3",
            Self::High => "p4",
        }
    }

    /// Full encoder argument list for a live HLS conversion.
    ///
    /// Output paths are relative: the subprocess runs with its working
    /// directory set to the camera's output directory.
    #[must_use]
    pub fn encoder_args(
        self,
        source_url: &str,
        segment_seconds: u32,
        playlist_size: u32,
    ) -> Vec<String> {
        let keyframe_interval = FRAME_RATE * segment_seconds;

        let mut args: Vec<String> = vec![
            // Decode and scale on the GPU; frames never leave GPU memory
            "-hwaccel".into(),
            "cuda".into(),
            "-hwaccel_output_format".into(),
            "cuda".into(),
            "-rtsp_transport".into(),
            "tcp".into(),
            "-fflags".into(),
            "nobuffer".into(),
            "-flags".into(),
            "low_delay".into(),
            "-i".into(),
            source_url.into(),
            "-vf".into(),
            format!("scale_cuda={},fps={FRAME_RATE}", self.scale()),
            "-c:v".into(),
            "h264_nvenc".into(),
            "-preset".into(),
            self.preset().into(),
            "-tune".into(),
            "ll".into(),
            "-rc".into(),
            "cbr".into(),
            "-b:v".into(),
            self.bitrate().into(),
            "-maxrate".into(),
            self.bitrate().into(),
            "-bufsize".into(),
            self.bitrate().into(),
            "-g".into(),
            keyframe_interval.to_string(),
            "-forced-idr".into(),
            "1".into(),
            "-sc_threshold".into(),
            "0".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "64k".into(),
            "-ar".into(),
            "22050".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            segment_seconds.to_string(),
            "-hls_list_size".into(),
            playlist_size.to_string(),
            "-hls_flags".into(),
            "delete_segments+independent_segments+append_list".into(),
            "-hls_segment_filename".into(),
            SEGMENT_PATTERN.into(),
            "-hls_segment_type".into(),
            "mpegts".into(),
            "-hls_delete_threshold".into(),
            "3".into(),
            "-hls_allow_cache".into(),
            "0".into(),
            "-start_number".into(),
            "0".into(),
            "-hls_start_number_source".into(),
            "epoch".into(),
            "-y".into(),
        ];
        args.push(MANIFEST_NAME.into());
        args
    }
}

impl FromStr for StreamQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown quality '{other}'")),
        }
    }
}

impl std::fmt::Display for StreamQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for q in [StreamQuality::Low, StreamQuality::Medium, StreamQuality::High] {
            assert_eq!(q.to_string().parse::<StreamQuality>(), Ok(q));
        }
        assert!("ultra".parse::<StreamQuality>().is_err());
    }

    #[test]
    fn test_encoder_args_embed_profile() {
        let args = StreamQuality::High.encoder_args("rtsp://cam/1", 2, 10);
        assert!(args.contains(&"rtsp://cam/1".to_string()));
        assert!(args.contains(&"scale_cuda=1280:720,fps=10".to_string()));
        assert!(args.contains(&"800k".to_string()));
        // Keyframe every segment: 10 fps * 2 s
        let g = args.iter().position(|a| a == "-g").expect("-g flag");
        assert_eq!(args[g + 1], "20");
        assert_eq!(args.last().map(String::as_str), Some(MANIFEST_NAME));
    }
}
