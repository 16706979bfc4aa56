use std::collections::BTreeMap;

use crate::error::{MediaJobError, Result};
use crate::job::{JobRequest, MediaSource, Operation};

const VIDEO_FORMATS: &[&str] = &["mp4", "mkv", "webm", "mov", "avi", "gif"];
const AUDIO_FORMATS: &[&str] = &["mp3", "aac", "m4a", "wav", "flac", "ogg", "opus"];
const IMAGE_FORMATS: &[&str] = &["jpg", "png"];
const PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow",
];
const MAX_DIMENSION: i32 = 8192;

/// How a trim's end point is given
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrimLength {
    Duration(f64),
    End(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixDuration {
    Longest,
    Shortest,
    First,
}

impl MixDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Longest => "longest",
            Self::Shortest => "shortest",
            Self::First => "first",
        }
    }
}

/// Validated, typed form of a request's operation and parameters
#[derive(Debug, Clone, PartialEq)]
pub enum OperationPlan {
    Convert {
        format: String,
        video_codec: Option<String>,
        audio_codec: Option<String>,
        video_bitrate: Option<String>,
        audio_bitrate: Option<String>,
        crf: Option<u8>,
        preset: Option<String>,
    },
    Trim {
        start: f64,
        length: TrimLength,
        format: String,
        reencode: bool,
    },
    ExtractAudio {
        format: String,
        bitrate: Option<String>,
        sample_rate: Option<u32>,
        channels: Option<u8>,
    },
    Mix {
        format: String,
        duration: MixDuration,
    },
    ExtractFrame {
        time: f64,
        format: String,
    },
    Resize {
        width: i32,
        height: i32,
        format: String,
    },
}

impl OperationPlan {
    /// Validate a request before it is queued: parameters plus source reachability
    pub fn from_request(request: &JobRequest) -> Result<Self> {
        let plan = Self::parse(request)?;
        for source in request.sources() {
            validate_source(source)?;
        }
        Ok(plan)
    }

    /// Validate a request's parameters for its operation.
    ///
    /// Unknown parameter names are rejected so a typo never silently
    /// produces a different transcode.
    pub fn parse(request: &JobRequest) -> Result<Self> {
        let mut params = Params::new(request.params())?;
        let operation = request.operation();

        if operation == Operation::Mix {
            if request.extra_sources().is_empty() {
                return Err(invalid("mix needs at least one extra source"));
            }
        } else if !request.extra_sources().is_empty() {
            return Err(invalid(format!("{} takes a single source", operation)));
        }

        let source_ext = request.source().extension();
        let plan = match operation {
            Operation::Convert => Self::Convert {
                format: params.required_format("format", VIDEO_FORMATS.iter().chain(AUDIO_FORMATS))?,
                video_codec: params.optional("video_codec", parse_codec)?,
                audio_codec: params.optional("audio_codec", parse_codec)?,
                video_bitrate: params.optional("video_bitrate", parse_bitrate)?,
                audio_bitrate: params.optional("audio_bitrate", parse_bitrate)?,
                crf: params.optional("crf", |v| parse_bounded(v, 0u8, 51u8))?,
                preset: params.optional("preset", |v| parse_choice(v, PRESETS))?,
            },
            Operation::Trim => {
                let start = params.optional("start", parse_time)?.unwrap_or(0.0);
                let duration = params.optional("duration", parse_time)?;
                let end = params.optional("end", parse_time)?;
                let length = match (duration, end) {
                    (Some(_), Some(_)) => return Err(invalid("trim takes either duration or end, not both")),
                    (Some(d), None) if d > 0.0 => TrimLength::Duration(d),
                    (None, Some(e)) if e > start => TrimLength::End(e),
                    (None, None) => return Err(invalid("trim needs a duration or an end time")),
                    _ => return Err(invalid("trim range is empty")),
                };
                let default_format = source_ext
                    .filter(|ext| VIDEO_FORMATS.contains(&ext.as_str()) || AUDIO_FORMATS.contains(&ext.as_str()))
                    .unwrap_or_else(|| "mp4".to_string());
                Self::Trim {
                    start,
                    length,
                    format: params
                        .optional("format", |v| parse_format(v, VIDEO_FORMATS.iter().chain(AUDIO_FORMATS)))?
                        .unwrap_or(default_format),
                    reencode: params.optional("reencode", parse_bool)?.unwrap_or(false),
                }
            }
            Operation::ExtractAudio => Self::ExtractAudio {
                format: params
                    .optional("format", |v| parse_format(v, AUDIO_FORMATS.iter()))?
                    .unwrap_or_else(|| "mp3".to_string()),
                bitrate: params.optional("bitrate", parse_bitrate)?,
                sample_rate: params.optional("sample_rate", |v| parse_bounded(v, 8_000u32, 192_000u32))?,
                channels: params.optional("channels", |v| parse_bounded(v, 1u8, 8u8))?,
            },
            Operation::Mix => Self::Mix {
                format: params
                    .optional("format", |v| parse_format(v, AUDIO_FORMATS.iter()))?
                    .unwrap_or_else(|| "mp3".to_string()),
                duration: params.optional("duration", parse_mix_duration)?.unwrap_or(MixDuration::Longest),
            },
            Operation::ExtractFrame => Self::ExtractFrame {
                time: params.optional("time", parse_time)?.unwrap_or(2.0),
                format: params
                    .optional("format", |v| parse_format(v, IMAGE_FORMATS.iter()))?
                    .unwrap_or_else(|| "jpg".to_string()),
            },
            Operation::Resize => {
                let width = params.optional("width", parse_dimension)?.unwrap_or(-2);
                let height = params.optional("height", parse_dimension)?.unwrap_or(-2);
                if width < 0 && height < 0 {
                    return Err(invalid("resize needs a width or a height"));
                }
                Self::Resize {
                    width,
                    height,
                    format: params
                        .optional("format", |v| parse_format(v, VIDEO_FORMATS.iter()))?
                        .unwrap_or_else(|| "mp4".to_string()),
                }
            }
        };

        params.finish()?;
        Ok(plan)
    }

    /// Extension of the produced artifact
    pub fn output_extension(&self) -> &str {
        match self {
            Self::Convert { format, .. }
            | Self::Trim { format, .. }
            | Self::ExtractAudio { format, .. }
            | Self::Mix { format, .. }
            | Self::ExtractFrame { format, .. }
            | Self::Resize { format, .. } => format,
        }
    }
}

fn validate_source(source: &MediaSource) -> Result<()> {
    match source {
        MediaSource::Local(path) => {
            if !path.is_file() {
                return Err(invalid(format!("source file not found: {}", path.display())));
            }
            Ok(())
        }
        MediaSource::Remote(url) => {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| invalid(format!("invalid source URL '{}': {}", url, e)))?;
            match parsed.scheme() {
                "http" | "https" => Ok(()),
                other => Err(invalid(format!("unsupported URL scheme '{}'", other))),
            }
        }
    }
}

/// Tracks which parameters were consumed so leftovers can be reported
struct Params<'a> {
    remaining: BTreeMap<String, &'a str>,
}

impl<'a> Params<'a> {
    /// Normalize keys; two keys that normalize to the same name are rejected
    fn new(params: &'a BTreeMap<String, String>) -> Result<Self> {
        let mut remaining = BTreeMap::new();
        for (key, value) in params {
            let normalized = key.trim().to_ascii_lowercase().replace('-', "_");
            if remaining.insert(normalized.clone(), value.trim()).is_some() {
                return Err(invalid(format!("parameter '{}' is given more than once", normalized)));
            }
        }
        Ok(Self { remaining })
    }

    fn optional<T>(&mut self, key: &str, parse: impl Fn(&str) -> Result<T>) -> Result<Option<T>> {
        match self.remaining.remove(key) {
            Some(value) => parse(value)
                .map(Some)
                .map_err(|e| invalid(format!("parameter '{}': {}", key, strip_prefix(&e)))),
            None => Ok(None),
        }
    }

    fn required_format<'f, I>(&mut self, key: &str, allowed: I) -> Result<String>
    where
        I: Iterator<Item = &'f &'f str> + Clone,
    {
        self.optional(key, |v| parse_format(v, allowed.clone()))?
            .ok_or_else(|| invalid(format!("missing required parameter '{}'", key)))
    }

    fn finish(self) -> Result<()> {
        if let Some(key) = self.remaining.keys().next() {
            return Err(invalid(format!("unknown parameter '{}'", key)));
        }
        Ok(())
    }
}

fn invalid<S: Into<String>>(message: S) -> MediaJobError {
    MediaJobError::InvalidParameters(message.into())
}

fn strip_prefix(err: &MediaJobError) -> String {
    match err {
        MediaJobError::InvalidParameters(message) => message.clone(),
        other => other.to_string(),
    }
}

fn parse_format<'f, I>(value: &str, allowed: I) -> Result<String>
where
    I: Iterator<Item = &'f &'f str>,
{
    let lower = value.to_ascii_lowercase();
    let lower = if lower == "jpeg" { "jpg".to_string() } else { lower };
    let allowed: Vec<&str> = allowed.copied().collect();
    if allowed.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        Err(invalid(format!("unsupported format '{}' (expected one of {})", value, allowed.join(", "))))
    }
}

fn parse_choice(value: &str, allowed: &[&str]) -> Result<String> {
    let lower = value.to_ascii_lowercase();
    if allowed.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        Err(invalid(format!("'{}' is not one of {}", value, allowed.join(", "))))
    }
}

/// Codec names are passed as a separate argument after their flag, but are
/// still restricted to the characters encoder names use.
fn parse_codec(value: &str) -> Result<String> {
    let valid = !value.is_empty()
        && value.len() <= 32
        && value.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(value.to_string())
    } else {
        Err(invalid(format!("invalid codec name '{}'", value)))
    }
}

/// Bitrates like `128k`, `2M` or `96000`
fn parse_bitrate(value: &str) -> Result<String> {
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => value.split_at(idx),
        None => (value, ""),
    };
    let unit_ok = matches!(unit, "" | "k" | "K" | "m" | "M");
    if digits.is_empty() || digits.len() > 9 || !unit_ok || digits.parse::<u64>().map_or(true, |n| n == 0) {
        return Err(invalid(format!("invalid bitrate '{}'", value)));
    }
    Ok(value.to_string())
}

fn parse_bounded<T>(value: &str, min: T, max: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let parsed: T = value
        .parse()
        .map_err(|_| invalid(format!("'{}' is not a number", value)))?;
    if parsed < min || parsed > max {
        return Err(invalid(format!("{} is outside {}..={}", parsed, min, max)));
    }
    Ok(parsed)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(format!("'{}' is not a boolean", value))),
    }
}

fn parse_mix_duration(value: &str) -> Result<MixDuration> {
    match value.to_ascii_lowercase().as_str() {
        "longest" => Ok(MixDuration::Longest),
        "shortest" => Ok(MixDuration::Shortest),
        "first" => Ok(MixDuration::First),
        _ => Err(invalid(format!("'{}' is not one of longest, shortest, first", value))),
    }
}

/// Positive pixel count, or -1/-2 to keep the aspect ratio
fn parse_dimension(value: &str) -> Result<i32> {
    let parsed: i32 = value
        .parse()
        .map_err(|_| invalid(format!("'{}' is not a number", value)))?;
    match parsed {
        -1 | -2 => Ok(parsed),
        1..=MAX_DIMENSION => Ok(parsed),
        _ => Err(invalid(format!("dimension {} is outside 1..={}", parsed, MAX_DIMENSION))),
    }
}

/// Seconds (`12.5`) or clock time (`MM:SS`, `HH:MM:SS.mmm`), non-negative
pub fn parse_time(value: &str) -> Result<f64> {
    let bad = || invalid(format!("invalid time '{}'", value));
    if value.is_empty() || value.starts_with('-') || value.starts_with('+') {
        return Err(bad());
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() > 3 {
        return Err(bad());
    }

    let mut seconds = 0.0;
    for (idx, part) in parts.iter().enumerate() {
        let is_last = idx == parts.len() - 1;
        let valid_chars = part.chars().all(|c| c.is_ascii_digit() || (is_last && c == '.'));
        if part.is_empty() || !valid_chars {
            return Err(bad());
        }
        let parsed: f64 = part.parse().map_err(|_| bad())?;
        if idx > 0 && parsed >= 60.0 {
            return Err(bad());
        }
        seconds = seconds * 60.0 + parsed;
    }

    if !seconds.is_finite() {
        return Err(bad());
    }
    Ok(seconds)
}

/// Seconds rendered the way ffmpeg expects them on the command line
pub fn format_seconds(seconds: f64) -> String {
    format!("{:.3}", seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RequesterId;
    use std::io::Write;

    fn source_file(ext: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(ext).tempfile().unwrap();
        file.write_all(b"media").unwrap();
        file
    }

    fn request(op: Operation, source: &tempfile::NamedTempFile) -> JobRequest {
        JobRequest::new(MediaSource::local(source.path()), op, RequesterId::new("tester"))
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("12.5").unwrap(), 12.5);
        assert_eq!(parse_time("01:30").unwrap(), 90.0);
        assert_eq!(parse_time("01:01:01.5").unwrap(), 3661.5);
        assert!(parse_time("-5").is_err());
        assert!(parse_time("1:75").is_err());
        assert!(parse_time("1.5:30").is_err());
        assert!(parse_time("abc").is_err());
        assert!(parse_time("1:2:3:4").is_err());
    }

    #[test]
    fn test_extract_audio_defaults() {
        let source = source_file(".mp4");
        let plan = OperationPlan::from_request(&request(Operation::ExtractAudio, &source)).unwrap();
        assert_eq!(
            plan,
            OperationPlan::ExtractAudio {
                format: "mp3".to_string(),
                bitrate: None,
                sample_rate: None,
                channels: None,
            }
        );
        assert_eq!(plan.output_extension(), "mp3");
    }

    #[test]
    fn test_convert_requires_format() {
        let source = source_file(".mp4");
        let err = OperationPlan::from_request(&request(Operation::Convert, &source)).unwrap_err();
        assert!(err.to_string().contains("format"));

        let plan = OperationPlan::from_request(
            &request(Operation::Convert, &source)
                .with_param("format", "WEBM")
                .with_param("video-codec", "libvpx-vp9")
                .with_param("crf", "30"),
        )
        .unwrap();
        match plan {
            OperationPlan::Convert { format, video_codec, crf, .. } => {
                assert_eq!(format, "webm");
                assert_eq!(video_codec.as_deref(), Some("libvpx-vp9"));
                assert_eq!(crf, Some(30));
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_rejects_flag_like_values() {
        let source = source_file(".mp4");
        for (key, value) in [
            ("video_codec", "-i"),
            ("video_codec", "copy;rm -rf /"),
            ("audio_bitrate", "-128k"),
            ("preset", "fast -y"),
        ] {
            let req = request(Operation::Convert, &source)
                .with_param("format", "mp4")
                .with_param(key, value);
            let err = OperationPlan::from_request(&req).unwrap_err();
            assert!(matches!(err, MediaJobError::InvalidParameters(_)), "{} = {}", key, value);
        }
    }

    #[test]
    fn test_rejects_unknown_parameter() {
        let source = source_file(".mp4");
        let req = request(Operation::ExtractAudio, &source).with_param("filter_complex", "x");
        let err = OperationPlan::from_request(&req).unwrap_err();
        assert!(err.to_string().contains("unknown parameter 'filter_complex'"));
    }

    #[test]
    fn test_rejects_keys_that_collide_after_normalization() {
        let source = source_file(".mp4");
        let req = request(Operation::ExtractAudio, &source)
            .with_param("Format", "wav")
            .with_param("format", "mp3");
        let err = OperationPlan::from_request(&req).unwrap_err();
        assert!(matches!(err, MediaJobError::InvalidParameters(_)));
        assert!(err.to_string().contains("'format' is given more than once"));

        let req = request(Operation::ExtractAudio, &source)
            .with_param("sample-rate", "44100")
            .with_param("sample_rate", "48000");
        assert!(OperationPlan::from_request(&req).is_err());
    }

    #[test]
    fn test_trim_ranges() {
        let source = source_file(".mkv");
        let plan = OperationPlan::from_request(
            &request(Operation::Trim, &source).with_param("start", "5").with_param("end", "00:00:08"),
        )
        .unwrap();
        assert_eq!(
            plan,
            OperationPlan::Trim {
                start: 5.0,
                length: TrimLength::End(8.0),
                format: "mkv".to_string(),
                reencode: false,
            }
        );

        let empty = request(Operation::Trim, &source).with_param("start", "9").with_param("end", "3");
        assert!(OperationPlan::from_request(&empty).is_err());
        let neither = request(Operation::Trim, &source);
        assert!(OperationPlan::from_request(&neither).is_err());
    }

    #[test]
    fn test_mix_needs_extra_source() {
        let source = source_file(".mp3");
        let other = source_file(".wav");
        assert!(OperationPlan::from_request(&request(Operation::Mix, &source)).is_err());

        let req = request(Operation::Mix, &source).with_extra_source(MediaSource::local(other.path()));
        let plan = OperationPlan::from_request(&req).unwrap();
        assert_eq!(
            plan,
            OperationPlan::Mix {
                format: "mp3".to_string(),
                duration: MixDuration::Longest,
            }
        );

        let extra_on_convert = request(Operation::Convert, &source)
            .with_param("format", "wav")
            .with_extra_source(MediaSource::local(other.path()));
        assert!(OperationPlan::from_request(&extra_on_convert).is_err());
    }

    #[test]
    fn test_missing_local_source() {
        let req = JobRequest::new(
            MediaSource::local("/definitely/not/here.mp4"),
            Operation::ExtractAudio,
            RequesterId::new("tester"),
        );
        let err = OperationPlan::from_request(&req).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_resize_dimensions() {
        let source = source_file(".mp4");
        let plan = OperationPlan::from_request(&request(Operation::Resize, &source).with_param("width", "640")).unwrap();
        assert_eq!(
            plan,
            OperationPlan::Resize {
                width: 640,
                height: -2,
                format: "mp4".to_string(),
            }
        );
        assert!(OperationPlan::from_request(&request(Operation::Resize, &source)).is_err());
        assert!(
            OperationPlan::from_request(&request(Operation::Resize, &source).with_param("width", "0")).is_err()
        );
    }
}
