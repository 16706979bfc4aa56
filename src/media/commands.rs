use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::plan::{format_seconds, OperationPlan, TrimLength};

/// Argument vector for one engine invocation.
///
/// Arguments are only ever passed to the process directly, never through a
/// shell, and every path goes through [`MediaCommand::input`] or
/// [`MediaCommand::output`], which pin it to the `file:` protocol.
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(file_url(path.as_ref()))
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(file_url(path.as_ref()))
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Set video codec
    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    /// Set audio codec
    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Copy video stream
    pub fn copy_video(self) -> Self {
        self.video_codec("copy")
    }

    /// Copy audio stream
    pub fn copy_audio(self) -> Self {
        self.audio_codec("copy")
    }

    /// Disable video
    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    /// Set audio sample rate
    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    /// Set audio channels
    pub fn audio_channels(self, channels: u8) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    /// Add video filter
    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    /// Build the process handle with all stdio piped for supervision
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Absolute `file:` URL for a path, so a name like `-x.mp4` or `http:foo`
/// is never read as a flag or a protocol
fn file_url(path: &Path) -> String {
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| Path::new(".").join(path))
    };
    format!("file:{}", absolute.display())
}

/// Builder for the operations the pipeline supports
pub struct MediaCommandBuilder {
    binary_path: String,
}

impl MediaCommandBuilder {
    /// Create a new command builder
    pub fn new<S: Into<String>>(binary_path: S) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Common prefix: quiet banner, errors only on stderr, overwrite
    fn base<S: Into<String>>(&self, description: S) -> MediaCommand {
        MediaCommand::new(&self.binary_path, description)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .overwrite()
    }

    /// Build the invocation for a validated plan
    pub fn build(&self, plan: &OperationPlan, inputs: &[PathBuf], output: &Path) -> MediaCommand {
        let primary = inputs.first().map(PathBuf::as_path).unwrap_or(Path::new(""));

        match plan {
            OperationPlan::Convert {
                format,
                video_codec,
                audio_codec,
                video_bitrate,
                audio_bitrate,
                crf,
                preset,
            } => {
                let mut cmd = self.base(format!("Convert to {}", format)).input(primary);
                if let Some(codec) = video_codec {
                    cmd = cmd.video_codec(codec);
                }
                if let Some(codec) = audio_codec {
                    cmd = cmd.audio_codec(codec);
                }
                if let Some(rate) = video_bitrate {
                    cmd = cmd.arg("-b:v").arg(rate);
                }
                if let Some(rate) = audio_bitrate {
                    cmd = cmd.arg("-b:a").arg(rate);
                }
                if let Some(crf) = crf {
                    cmd = cmd.arg("-crf").arg(crf.to_string());
                }
                if let Some(preset) = preset {
                    cmd = cmd.arg("-preset").arg(preset);
                }
                cmd.output(output)
            }
            OperationPlan::Trim {
                start,
                length,
                reencode,
                ..
            } => {
                let mut cmd = self
                    .base("Trim")
                    .arg("-ss")
                    .arg(format_seconds(*start))
                    .input(primary);
                cmd = match length {
                    TrimLength::Duration(duration) => cmd.arg("-t").arg(format_seconds(*duration)),
                    TrimLength::End(end) => cmd.arg("-t").arg(format_seconds(end - start)),
                };
                if !reencode {
                    cmd = cmd.copy_video().copy_audio();
                }
                cmd.output(output)
            }
            OperationPlan::ExtractAudio {
                format,
                bitrate,
                sample_rate,
                channels,
            } => {
                let mut cmd = self
                    .base("Audio extraction")
                    .input(primary)
                    .no_video()
                    .audio_codec(audio_encoder(format));
                if let Some(rate) = bitrate {
                    cmd = cmd.arg("-b:a").arg(rate);
                }
                if let Some(rate) = sample_rate {
                    cmd = cmd.audio_sample_rate(*rate);
                }
                if let Some(channels) = channels {
                    cmd = cmd.audio_channels(*channels);
                }
                cmd.output(output)
            }
            OperationPlan::Mix { format, duration } => {
                let mut cmd = self.base(format!("Mix {} inputs", inputs.len()));
                for input in inputs {
                    cmd = cmd.input(input);
                }
                cmd.arg("-filter_complex")
                    .arg(format!(
                        "amix=inputs={}:duration={}:dropout_transition=0",
                        inputs.len(),
                        duration.as_str()
                    ))
                    .no_video()
                    .audio_codec(audio_encoder(format))
                    .output(output)
            }
            OperationPlan::ExtractFrame { time, .. } => self
                .base(format!("Extract frame at {}s", format_seconds(*time)))
                .arg("-ss")
                .arg(format_seconds(*time))
                .input(primary)
                .arg("-frames:v")
                .arg("1")
                .output(output),
            OperationPlan::Resize { width, height, .. } => self
                .base(format!("Resize to {}x{}", width, height))
                .input(primary)
                .video_filter(format!("scale={}:{}", width, height))
                .copy_audio()
                .output(output),
        }
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}

/// Encoder matching an audio container
fn audio_encoder(format: &str) -> &'static str {
    match format {
        "mp3" => "libmp3lame",
        "aac" | "m4a" => "aac",
        "wav" => "pcm_s16le",
        "flac" => "flac",
        "ogg" => "libvorbis",
        "opus" => "libopus",
        _ => "copy",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::plan::MixDuration;

    fn builder() -> MediaCommandBuilder {
        MediaCommandBuilder::new("ffmpeg")
    }

    #[test]
    fn test_extract_audio_args() {
        let plan = OperationPlan::ExtractAudio {
            format: "mp3".to_string(),
            bitrate: Some("192k".to_string()),
            sample_rate: None,
            channels: Some(1),
        };
        let cmd = builder().build(&plan, &[PathBuf::from("/work/source.mp4")], Path::new("/work/output.mp3"));

        assert_eq!(cmd.binary_path, "ffmpeg");
        assert_eq!(
            cmd.args,
            vec![
                "-hide_banner", "-loglevel", "error", "-y", "-i", "file:/work/source.mp4", "-vn", "-c:a",
                "libmp3lame", "-b:a", "192k", "-ac", "1", "file:/work/output.mp3",
            ]
        );
    }

    #[test]
    fn test_hostile_file_names_stay_paths() {
        let plan = OperationPlan::ExtractFrame {
            time: 0.0,
            format: "jpg".to_string(),
        };
        let cmd = builder().build(&plan, &[PathBuf::from("/in/-y; rm -rf ~.mp4")], Path::new("/out/frame.jpg"));
        assert!(cmd.args.contains(&"file:/in/-y; rm -rf ~.mp4".to_string()));
        assert!(!cmd.args.iter().any(|a| a == "-y; rm -rf ~.mp4"));
    }

    #[test]
    fn test_trim_end_becomes_duration() {
        let plan = OperationPlan::Trim {
            start: 5.0,
            length: TrimLength::End(8.5),
            format: "mp4".to_string(),
            reencode: false,
        };
        let cmd = builder().build(&plan, &[PathBuf::from("/a.mp4")], Path::new("/b.mp4"));
        let args = cmd.args.join(" ");
        assert!(args.contains("-ss 5.000 -i file:/a.mp4 -t 3.500 -c:v copy -c:a copy"));
    }

    #[test]
    fn test_mix_uses_every_input() {
        let plan = OperationPlan::Mix {
            format: "wav".to_string(),
            duration: MixDuration::Shortest,
        };
        let inputs = vec![PathBuf::from("/a.mp3"), PathBuf::from("/b.mp3"), PathBuf::from("/c.mp3")];
        let cmd = builder().build(&plan, &inputs, Path::new("/mix.wav"));
        assert_eq!(cmd.args.iter().filter(|a| *a == "-i").count(), 3);
        assert!(cmd.args.contains(&"amix=inputs=3:duration=shortest:dropout_transition=0".to_string()));
        assert!(cmd.args.contains(&"pcm_s16le".to_string()));
    }
}
