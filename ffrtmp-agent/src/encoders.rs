use ffrtmp_common::model::EnginePreference;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Ffmpeg,
    Gstreamer,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Ffmpeg => "ffmpeg",
            Engine::Gstreamer => "gstreamer",
        }
    }
}

/// Which transcoders are installed on this worker; probed once at
/// startup and advertised through metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderAvailability {
    pub ffmpeg: bool,
    pub gstreamer: bool,
}

pub async fn probe() -> EncoderAvailability {
    let ffmpeg = probe_command("ffmpeg", &["-version"]).await;
    let gstreamer = probe_command("gst-launch-1.0", &["--version"]).await;
    debug!(ffmpeg, gstreamer, "probed encoder availability");
    if !ffmpeg && !gstreamer {
        warn!("neither ffmpeg nor gstreamer is installed, jobs will fail");
    }
    EncoderAvailability { ffmpeg, gstreamer }
}

async fn probe_command(command: &str, args: &[&str]) -> bool {
    tokio::process::Command::new(command)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

pub fn select_engine(
    preference: EnginePreference,
    availability: EncoderAvailability,
) -> Result<Engine, String> {
    match preference {
        EnginePreference::Ffmpeg if availability.ffmpeg => Ok(Engine::Ffmpeg),
        EnginePreference::Ffmpeg => Err("ffmpeg requested but not installed".to_string()),
        EnginePreference::Gstreamer if availability.gstreamer => Ok(Engine::Gstreamer),
        EnginePreference::Gstreamer => Err("gstreamer requested but not installed".to_string()),
        EnginePreference::Auto if availability.ffmpeg => Ok(Engine::Ffmpeg),
        EnginePreference::Auto if availability.gstreamer => Ok(Engine::Gstreamer),
        EnginePreference::Auto => Err("no transcoder installed".to_string()),
    }
}

/// Maps the scenario string to encoder settings. Unknown scenarios fall
/// back to a plain H.264 transcode.
fn scenario_video_settings(scenario: &str) -> (&'static str, Option<&'static str>) {
    let codec = if scenario.starts_with("h265") || scenario.starts_with("hevc") {
        "libx265"
    } else if scenario.starts_with("vp9") {
        "libvpx-vp9"
    } else if scenario.starts_with("av1") {
        "libaom-av1"
    } else {
        "libx264"
    };

    let scale = if scenario.ends_with("2160p") || scenario.ends_with("4k") {
        Some("3840:2160")
    } else if scenario.ends_with("1080p") {
        Some("1920:1080")
    } else if scenario.ends_with("720p") {
        Some("1280:720")
    } else if scenario.ends_with("480p") {
        Some("854:480")
    } else {
        None
    };

    (codec, scale)
}

/// The transcoder invocation for a claimed job. The returned command is
/// executed through the governance wrapper, never directly.
pub fn transcode_command(
    engine: Engine,
    scenario: &str,
    input: &Path,
    output: &Path,
    parameters: &HashMap<String, serde_json::Value>,
) -> (String, Vec<String>) {
    let (codec, scale) = scenario_video_settings(scenario);
    let preset = parameters
        .get("preset")
        .and_then(|value| value.as_str())
        .unwrap_or("veryfast");

    match engine {
        Engine::Ffmpeg => {
            let mut args = vec![
                "-hide_banner".to_string(),
                "-y".to_string(),
                "-i".to_string(),
                input.display().to_string(),
                "-c:v".to_string(),
                codec.to_string(),
            ];
            if codec == "libx264" || codec == "libx265" {
                args.push("-preset".to_string());
                args.push(preset.to_string());
            }
            if let Some(scale) = scale {
                args.push("-vf".to_string());
                args.push(format!("scale={scale}"));
            }
            args.push("-c:a".to_string());
            args.push("copy".to_string());
            args.push(output.display().to_string());
            ("ffmpeg".to_string(), args)
        }
        Engine::Gstreamer => {
            let encoder = match codec {
                "libx265" => "x265enc",
                "libvpx-vp9" => "vp9enc",
                _ => "x264enc",
            };
            let args = vec![
                "-e".to_string(),
                format!("filesrc location={}", input.display()),
                "!".to_string(),
                "decodebin".to_string(),
                "!".to_string(),
                "videoconvert".to_string(),
                "!".to_string(),
                encoder.to_string(),
                "!".to_string(),
                "mp4mux".to_string(),
                "!".to_string(),
                format!("filesink location={}", output.display()),
            ];
            ("gst-launch-1.0".to_string(), args)
        }
    }
}

/// Synthesizes a test input when the job does not reference one.
pub fn input_generation_command(output: &Path, duration_sec: u64) -> (String, Vec<String>) {
    (
        "ffmpeg".to_string(),
        vec![
            "-hide_banner".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("testsrc=duration={duration_sec}:size=1280x720:rate=30"),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("sine=frequency=440:duration={duration_sec}"),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "ultrafast".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            output.display().to_string(),
        ],
    )
}
