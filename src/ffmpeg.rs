// src/ffmpeg.rs

use crate::error::{KfevalError, Result};
use crate::frame_store;
use log::{debug, error, info};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

/// Output naming for extracted frames; `%04d` expands to the frame index.
const FRAME_PATTERN: &str = "frame_%04d.jpg";

#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_count: Option<u64>,
    pub fps: f64,
}

/// Runs `program` to completion, returning its stdout. A non-zero exit maps to
/// `Command` with the tool's stderr.
fn run_tool(program: &str, args: &[OsString], description: &str) -> Result<String> {
    debug!(
        "{} for {}: {} {}",
        program,
        description,
        program,
        args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
    );
    let start_time = Instant::now();
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| KfevalError::Command(format!("could not start {}: {}", program, e)))?;
    let elapsed = start_time.elapsed();
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        error!("{} failed for {} after {:.2?}: {}", program, description, elapsed, stderr.trim());
        return Err(KfevalError::Command(format!(
            "{} failed for {} ({}): {}",
            program,
            description,
            output.status,
            stderr.trim()
        )));
    }
    if !stderr.trim().is_empty() {
        debug!("{} stderr for {}: {}", program, description, stderr.trim());
    }
    debug!("{} finished {} in {:.2?}", program, description, elapsed);
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Reads stream metadata of the first video stream with ffprobe.
pub fn probe_video(video_path: &Path) -> Result<VideoInfo> {
    if !video_path.is_file() {
        return Err(KfevalError::Input(format!("Video not found: {}", video_path.display())));
    }
    let mut args: Vec<OsString> = [
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height,nb_frames,r_frame_rate",
        "-of",
        "json",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(video_path.as_os_str().to_os_string());

    let stdout = run_tool("ffprobe", &args, &format!("probing {}", video_path.display()))?;
    parse_probe_output(video_path, &stdout)
}

fn parse_probe_output(video_path: &Path, stdout: &str) -> Result<VideoInfo> {
    let json: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| KfevalError::Parse(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let stream = json["streams"]
        .get(0)
        .ok_or_else(|| KfevalError::Parse("No video stream found in ffprobe output".to_string()))?;

    let width = stream["width"]
        .as_u64()
        .ok_or_else(|| KfevalError::Parse("Missing width".to_string()))? as u32;
    let height = stream["height"]
        .as_u64()
        .ok_or_else(|| KfevalError::Parse("Missing height".to_string()))? as u32;
    // Containers without an index report nb_frames as absent or "N/A".
    let frame_count = stream["nb_frames"].as_str().and_then(|s| s.parse::<u64>().ok());

    let fps_str = stream["r_frame_rate"]
        .as_str()
        .ok_or_else(|| KfevalError::Parse("Missing r_frame_rate".to_string()))?;
    let fps = parse_frame_rate(fps_str)?;

    info!(
        "{}: {}x{} @ {:.3} fps, {} frames",
        video_path.display(),
        width,
        height,
        fps,
        frame_count.map_or("unknown".to_string(), |n| n.to_string())
    );

    Ok(VideoInfo {
        path: video_path.to_path_buf(),
        width,
        height,
        frame_count,
        fps,
    })
}

/// Parses frame rate string (e.g., "24000/1001") into f64.
fn parse_frame_rate(fps_str: &str) -> Result<f64> {
    match fps_str.split_once('/') {
        Some((num, den)) => {
            let num = num
                .parse::<f64>()
                .map_err(|_| KfevalError::Parse(format!("Invalid FPS numerator: {}", num)))?;
            let den = den
                .parse::<f64>()
                .map_err(|_| KfevalError::Parse(format!("Invalid FPS denominator: {}", den)))?;
            if den == 0.0 {
                Err(KfevalError::Parse("FPS denominator cannot be zero".to_string()))
            } else {
                Ok(num / den)
            }
        }
        None => fps_str
            .parse::<f64>()
            .map_err(|_| KfevalError::Parse(format!("Invalid FPS format: {}", fps_str))),
    }
}

fn count_frames(folder: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(folder)? {
        let name = entry?.file_name();
        if frame_store::parse_frame_index(&name.to_string_lossy()).is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// Dumps every frame of `video` as `frame_<NNNN>.jpg` (starting at 0) into
/// `output_dir`. A folder that already holds frames is left untouched.
pub fn extract_frames(video: &Path, output_dir: &Path) -> Result<usize> {
    if output_dir.is_dir() {
        let existing = count_frames(output_dir)?;
        if existing > 0 {
            info!(
                "{} already holds {} frames, skipping extraction",
                output_dir.display(),
                existing
            );
            return Ok(existing);
        }
    }

    let info = probe_video(video)?;
    fs::create_dir_all(output_dir)?;

    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "warning", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(info.path.as_os_str().to_os_string());
    // Highest JPEG quality; numbering starts at 0 to match frame indices.
    args.extend(["-q:v", "2", "-start_number", "0"].iter().map(OsString::from));
    args.push(output_dir.join(FRAME_PATTERN).into_os_string());

    info!("Extracting frames of {} into {}", video.display(), output_dir.display());
    run_tool("ffmpeg", &args, &format!("extracting {}", video.display()))?;

    let extracted = count_frames(output_dir)?;
    if extracted == 0 {
        return Err(KfevalError::Command(format!(
            "FFmpeg produced no frames from {}",
            video.display()
        )));
    }
    if let Some(expected) = info.frame_count {
        if expected != extracted as u64 {
            info!(
                "Extracted {} frames, container reported {}",
                extracted, expected
            );
        }
    }
    info!(
        "Extracted {} frames ({}x{} @ {:.2} fps) to {}",
        extracted,
        info.width,
        info.height,
        info.fps,
        output_dir.display()
    );
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn frame_rates_parse() {
        assert!((parse_frame_rate("24000/1001").unwrap() - 23.976).abs() < 1e-3);
        assert_eq!(parse_frame_rate("30").unwrap(), 30.0);
        assert!(parse_frame_rate("30/0").is_err());
        assert!(parse_frame_rate("abc").is_err());
    }

    #[test]
    fn probe_output_parses() {
        let json = r#"{"streams":[{"width":1920,"height":1080,"r_frame_rate":"30/1","nb_frames":"450"}]}"#;
        let info = parse_probe_output(Path::new("clip.mp4"), json).unwrap();
        assert_eq!((info.width, info.height, info.frame_count), (1920, 1080, Some(450)));
        assert_eq!(info.fps, 30.0);

        let no_count = r#"{"streams":[{"width":64,"height":48,"r_frame_rate":"25/1","nb_frames":"N/A"}]}"#;
        assert_eq!(parse_probe_output(Path::new("x.mkv"), no_count).unwrap().frame_count, None);

        assert!(parse_probe_output(Path::new("x.mkv"), r#"{"streams":[]}"#).is_err());
    }

    #[test]
    fn existing_frames_skip_extraction() {
        let dir = tempdir().unwrap();
        for i in 0..3 {
            fs::write(dir.path().join(format!("frame_{:04}.jpg", i)), b"x").unwrap();
        }
        // The video path is never touched when frames already exist.
        let count = extract_frames(Path::new("/nonexistent/video.mp4"), dir.path()).unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn missing_video_is_an_input_error() {
        let dir = tempdir().unwrap();
        let err = extract_frames(Path::new("/nonexistent/video.mp4"), &dir.path().join("frames")).unwrap_err();
        assert!(matches!(err, KfevalError::Input(_)));
    }
}
