//! Transcoder command construction.
//!
//! The transcoder (`tsreplace`) replaces the video stream of a transport
//! stream in place, piping it through an encoder program. The encoder and its
//! arguments come from one of a closed set of backends.

use crate::config::{EncoderConfig, ToolsConfig};
use crate::encode::probe::StreamLayout;
use crate::task::{Codec, EncoderKind, EncodingTask};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Encoder program the transcoder pipes video through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderBackend {
    Ffmpeg,
    QsvEncC,
    NvEncC,
    VceEncC,
}

impl EncoderBackend {
    /// Maps a configured hardware encoder name to a backend.
    ///
    /// Unrecognized names fall back to FFmpeg.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "qsvencc" => EncoderBackend::QsvEncC,
            "nvencc" => EncoderBackend::NvEncC,
            "vceencc" => EncoderBackend::VceEncC,
            _ => EncoderBackend::Ffmpeg,
        }
    }

    /// Backend used for a job. Software jobs always run through FFmpeg.
    pub fn for_job(kind: EncoderKind, hardware_encoder: &str) -> Self {
        match kind {
            EncoderKind::Software => EncoderBackend::Ffmpeg,
            EncoderKind::Hardware => Self::from_name(hardware_encoder),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EncoderBackend::Ffmpeg => "FFmpeg",
            EncoderBackend::QsvEncC => "QSVEncC",
            EncoderBackend::NvEncC => "NVEncC",
            EncoderBackend::VceEncC => "VCEEncC",
        }
    }

    pub fn is_hardware(self) -> bool {
        self != EncoderBackend::Ffmpeg
    }

    pub fn program_path(self, tools: &ToolsConfig) -> &Path {
        match self {
            EncoderBackend::Ffmpeg => &tools.ffmpeg_path,
            EncoderBackend::QsvEncC => &tools.qsvencc_path,
            EncoderBackend::NvEncC => &tools.nvencc_path,
            EncoderBackend::VceEncC => &tools.vceencc_path,
        }
    }

    /// User-supplied option string for this backend and codec.
    pub fn custom_options(self, encoder: &EncoderConfig, codec: Codec) -> &str {
        match (self, codec) {
            (EncoderBackend::Ffmpeg, Codec::H264) => &encoder.ffmpeg_h264_options,
            (EncoderBackend::Ffmpeg, Codec::Hevc) => &encoder.ffmpeg_hevc_options,
            (EncoderBackend::QsvEncC, Codec::H264) => &encoder.intel_h264_options,
            (EncoderBackend::QsvEncC, Codec::Hevc) => &encoder.intel_hevc_options,
            (EncoderBackend::NvEncC, Codec::H264) => &encoder.nvidia_h264_options,
            (EncoderBackend::NvEncC, Codec::Hevc) => &encoder.nvidia_hevc_options,
            (EncoderBackend::VceEncC, Codec::H264) => &encoder.amd_h264_options,
            (EncoderBackend::VceEncC, Codec::Hevc) => &encoder.amd_hevc_options,
        }
    }

    /// Built-in argument template. Encoders read and write MPEG-TS on stdio.
    pub fn template_args(self, codec: Codec, preset: &str, layout: &StreamLayout) -> Vec<String> {
        let args: Vec<&str> = match self {
            EncoderBackend::Ffmpeg => {
                let mut args = vec!["-y", "-f", "mpegts", "-i", "-"];
                // Only the primary video stream is re-encoded.
                if layout.video > 1 {
                    args.extend(["-map", "0:v:0"]);
                }
                args.extend(["-copyts", "-start_at_zero", "-vf", "yadif", "-an"]);
                let lib = match codec {
                    Codec::H264 => "libx264",
                    Codec::Hevc => "libx265",
                };
                args.extend(["-c:v", lib, "-preset", preset]);
                args.extend(["-crf", "23", "-g", "90", "-f", "mpegts", "-"]);
                args
            }
            EncoderBackend::QsvEncC | EncoderBackend::NvEncC => {
                let rate_control = if self == EncoderBackend::QsvEncC {
                    "--icq"
                } else {
                    "--qvbr"
                };
                vec![
                    "-i", "-",
                    "--input-format", "mpegts",
                    "--tff",
                    "--vpp-deinterlace", "normal",
                    "-c", codec.as_str(),
                    rate_control, "23",
                    "--gop-len", "90",
                    "--output-format", "mpegts",
                    "-o", "-",
                ]
            }
            EncoderBackend::VceEncC => vec![
                "-i", "-",
                "--input-format", "mpegts",
                "--interlace", "tff",
                "--vpp-afs",
                "-c", codec.as_str(),
                "--cqp", "23",
                "--gop-len", "90",
                "--output-format", "mpegts",
                "-o", "-",
            ],
        };
        args.into_iter().map(String::from).collect()
    }

    /// Custom options when configured, the built-in template otherwise.
    pub fn encoder_args(
        self,
        encoder: &EncoderConfig,
        codec: Codec,
        preset: &str,
        layout: &StreamLayout,
    ) -> Vec<String> {
        let custom = self.custom_options(encoder, codec);
        if custom.trim().is_empty() {
            self.template_args(codec, preset, layout)
        } else {
            custom.split_whitespace().map(String::from).collect()
        }
    }
}

/// Fully resolved transcoder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub backend: EncoderBackend,
}

impl TranscodeCommand {
    /// `tsreplace -i <input> -o <output> -e <encoder_path> <encoder args...>`
    pub fn new(
        tsreplace: &Path,
        input: &Path,
        output: &Path,
        backend: EncoderBackend,
        encoder_path: &Path,
        encoder_args: Vec<String>,
    ) -> Self {
        let mut args: Vec<OsString> = Vec::with_capacity(6 + encoder_args.len());
        args.push("-i".into());
        args.push(input.into());
        args.push("-o".into());
        args.push(output.into());
        args.push("-e".into());
        args.push(encoder_path.into());
        args.extend(encoder_args.into_iter().map(OsString::from));

        Self {
            program: tsreplace.to_path_buf(),
            args,
            backend,
        }
    }

    /// Human readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(|a| a.as_os_str()))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds transcoder commands for tasks from configuration.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    tools: ToolsConfig,
    encoder: EncoderConfig,
}

impl CommandBuilder {
    pub fn new(tools: ToolsConfig, encoder: EncoderConfig) -> Self {
        Self { tools, encoder }
    }

    pub fn backend_for(&self, kind: EncoderKind) -> EncoderBackend {
        EncoderBackend::for_job(kind, &self.encoder.hardware_encoder)
    }

    pub fn build(&self, task: &EncodingTask, layout: &StreamLayout) -> TranscodeCommand {
        let backend = self.backend_for(task.encoder_kind);
        let encoder_args =
            backend.encoder_args(&self.encoder, task.codec, &task.quality_preset, layout);
        TranscodeCommand::new(
            &self.tools.tsreplace_path,
            &task.input_path,
            &task.output_path,
            backend,
            backend.program_path(&self.tools),
            encoder_args,
        )
    }
}
