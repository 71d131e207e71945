//! A shell script that stands in for ffmpeg in tests.
//!
//! Preview runs write tiny JPEGs into the directory of the output pattern,
//! following one of the behaviours below. Recording runs (output ends in
//! `.mp4`) write a marker line, wait for the quit command on stdin and
//! append `got=<command>` to the output file.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

pub enum Preview {
    /// A frame every 50ms for up to 30s.
    Continuous,
    /// Three frames, then exit.
    ExitAfterFrames,
    /// Two frames, then hang without writing more.
    StallAfterFrames,
    /// The first run writes two frames and exits. Every later run exits
    /// with an error before writing anything.
    OnceThenFail,
    /// Like `OnceThenFail`, but later runs hang without writing frames.
    OnceThenHang,
}

pub fn write_fake_ffmpeg(dir: &Path, preview: Preview) -> PathBuf {
    let marker = dir.join("first_run_done");
    let once = |later: &str| {
        format!(
            "if [ -e '{marker}' ]; then {later}; fi\n\
             touch '{marker}'\nframe 1\nsleep 0.1\nframe 2\nexit 0\n",
            marker = marker.display(),
            later = later,
        )
    };
    let body = match preview {
        Preview::Continuous => {
            "i=1\nwhile [ $i -le 600 ]; do frame $i; i=$((i+1)); sleep 0.05; done\n".to_string()
        }
        Preview::ExitAfterFrames => "frame 1\nsleep 0.05\nframe 2\nsleep 0.05\nframe 3\nexit 0\n".to_string(),
        Preview::StallAfterFrames => "frame 1\nframe 2\nexec sleep 30\n".to_string(),
        Preview::OnceThenFail => once("exit 1"),
        Preview::OnceThenHang => once("exec sleep 30"),
    };

    let script = format!(
        r#"#!/bin/sh
for last; do :; done
case "$last" in
  *.mp4)
    printf 'recording\n' > "$last"
    read -r cmd
    printf 'got=%s\n' "$cmd" >> "$last"
    exit 0
    ;;
esac
dir=$(dirname "$last")
frame() {{
  printf '\377\330\377\331' > "$dir/frame_$(printf '%06d' "$1").jpg"
}}
{body}"#,
        body = body,
    );

    let path = dir.join("fake-ffmpeg.sh");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Fast timings, paths under `dir` and the fake binary.
pub fn fake_config(dir: &Path, ffmpeg: &Path) -> Arc<Config> {
    let mut config = Config::default();
    config.ffmpeg.binary = ffmpeg.display().to_string();
    config.ffmpeg.log_stderr = false;
    config.ffmpeg.stop_grace = Duration::from_millis(500);
    config.streaming.frame_directory = dir.join("frames");
    config.streaming.poll_interval = Duration::from_millis(10);
    config.streaming.first_frame_timeout = Duration::from_secs(3);
    config.streaming.stall_timeout = Duration::from_millis(400);
    config.streaming.reconnect_attempts = 2;
    config.streaming.reconnect_delay = Duration::from_millis(20);
    config.streaming.watch_events = false;
    config.recording.output_directory = dir.join("recordings");
    Arc::new(config)
}

pub fn frame_files(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("frame_"))
            .count(),
        Err(_) => 0,
    }
}
