//! Command-line flags, applied on top of the file and environment layers

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::camera::{CameraBackend, Mode, Orientation, Rotation};
use crate::{Config, MIN_SNAPSHOT_INTERVAL_SECS, SCALING_RANGE};

/// Waits for a client to connect and then streams the camera's H.264 video
/// to it. Meanwhile, regardless of anybody connecting, still snapshots are
/// saved on a schedule.
#[derive(Debug, Parser)]
#[command(name = "rpicam", version, about, max_term_width = 120)]
pub struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log debugging info
    #[arg(long, overrides_with = "no_debug")]
    pub debug: bool,
    #[arg(long, overrides_with = "debug")]
    pub no_debug: bool,

    /// IP to bind the listening server to
    #[arg(long, value_name = "IP")]
    pub bind: Option<IpAddr>,

    /// Port to bind the listening server to
    #[arg(long)]
    pub port: Option<u16>,

    /// Portrait mode switches the width/height params
    #[arg(long, value_enum)]
    pub orientation: Option<Orientation>,

    /// Orientation adjustment if the camera is mounted upside down
    #[arg(long, value_parser = parse_rotation, value_name = "0|90|180|270")]
    pub rotation: Option<Rotation>,

    /// Quick settings for video/image resolution
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Video framerate
    #[arg(long, value_name = "FPS")]
    pub framerate: Option<f64>,

    /// Video width
    #[arg(long, value_name = "PIXELS")]
    pub width: Option<u32>,

    /// Video height
    #[arg(long, value_name = "PIXELS")]
    pub height: Option<u32>,

    /// Take still image snapshots
    #[arg(long, overrides_with = "no_snapshot")]
    pub snapshot: bool,
    #[arg(long, overrides_with = "snapshot")]
    pub no_snapshot: bool,

    /// Snapshot resolution scaling as a proportion of the video width/height
    #[arg(long, value_parser = parse_scaling)]
    pub scaling: Option<f64>,

    /// Snapshot interval
    #[arg(
        long,
        value_name = "SECONDS",
        value_parser = clap::value_parser!(u64).range(MIN_SNAPSHOT_INTERVAL_SECS..)
    )]
    pub interval: Option<u64>,

    /// Base path to save snapshots to
    #[arg(long, value_name = "PATH")]
    pub base: Option<PathBuf>,

    /// Only start taking snapshots after this time
    #[arg(long, num_args = 2, value_names = ["HOUR", "MINUTE"])]
    pub start: Option<Vec<u32>>,

    /// And stop taking snapshots after this time. Set equal to --start to
    /// always take snapshots every --interval seconds
    #[arg(long, num_args = 2, value_names = ["HOUR", "MINUTE"])]
    pub stop: Option<Vec<u32>>,

    /// Camera implementation
    #[arg(long, value_enum)]
    pub camera: Option<CameraBackend>,

    /// GStreamer source element, e.g. "v4l2src device=/dev/video0"
    #[arg(long)]
    pub source: Option<String>,
}

fn parse_rotation(value: &str) -> Result<Rotation, String> {
    let degrees: u16 = value
        .parse()
        .map_err(|_| format!("{value} is not a number of degrees"))?;
    Rotation::try_from(degrees).map_err(|e| e.to_string())
}

fn parse_scaling(value: &str) -> Result<f64, String> {
    let scaling: f64 = value
        .parse()
        .map_err(|_| format!("{value} is not a number"))?;
    if SCALING_RANGE.contains(&scaling) {
        Ok(scaling)
    } else {
        Err(format!(
            "{scaling} is not in {}..={}",
            SCALING_RANGE.start(),
            SCALING_RANGE.end()
        ))
    }
}

fn switch(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn pair(values: &[u32]) -> Option<[u32; 2]> {
    match values {
        [hour, minute] => Some([*hour, *minute]),
        _ => None,
    }
}

impl Args {
    /// Override `config` with every flag that was given
    pub fn apply(&self, config: &mut Config) {
        if let Some(debug) = switch(self.debug, self.no_debug) {
            config.logging.debug = debug;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }

        let camera = &mut config.camera;
        if let Some(backend) = self.camera {
            camera.backend = backend;
        }
        if let Some(source) = &self.source {
            camera.source.clone_from(source);
        }
        if let Some(mode) = self.mode {
            camera.mode = mode;
        }
        if let Some(orientation) = self.orientation {
            camera.orientation = orientation;
        }
        if let Some(rotation) = self.rotation {
            camera.rotation = rotation;
        }
        if let Some(framerate) = self.framerate {
            camera.framerate = framerate;
        }
        if let Some(width) = self.width {
            camera.width = width;
        }
        if let Some(height) = self.height {
            camera.height = height;
        }
        if let Some(scaling) = self.scaling {
            camera.scaling = scaling;
        }

        let snapshot = &mut config.snapshot;
        if let Some(enabled) = switch(self.snapshot, self.no_snapshot) {
            snapshot.enabled = enabled;
        }
        if let Some(interval) = self.interval {
            snapshot.interval_secs = interval;
        }
        if let Some(base) = &self.base {
            snapshot.base.clone_from(base);
        }
        if let Some(start) = self.start.as_deref().and_then(pair) {
            snapshot.start = start;
        }
        if let Some(stop) = self.stop.as_deref().and_then(pair) {
            snapshot.stop = stop;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Resolution;

    fn parse(args: &[&str]) -> Config {
        let argv = std::iter::once("rpicam").chain(args.iter().copied());
        let args = Args::try_parse_from(argv).unwrap();
        let mut config = Config::default();
        args.apply(&mut config);
        config
    }

    #[test]
    fn no_flags_keep_defaults() {
        let config = parse(&[]);
        assert!(config.snapshot.enabled);
        assert!(config.logging.debug);
        assert_eq!(config.server.port, 50007);
    }

    #[test]
    fn manual_mode_uses_given_dimensions() {
        let config = parse(&[
            "--mode", "manual", "--width", "1280", "--height", "720", "--framerate", "25",
        ]);
        let settings = config.camera.settings();
        assert_eq!(settings.video, Resolution::new(1280, 720));
        assert_eq!(settings.framerate, 25.0);
    }

    #[test]
    fn window_takes_hour_and_minute() {
        let config = parse(&["--start", "23", "30", "--stop", "4", "15"]);
        assert_eq!(config.snapshot.start, [23, 30]);
        assert_eq!(config.snapshot.stop, [4, 15]);
    }

    #[test]
    fn negated_switches_turn_features_off() {
        let config = parse(&["--no-snapshot", "--no-debug"]);
        assert!(!config.snapshot.enabled);
        assert!(!config.logging.debug);
    }

    #[test]
    fn later_switch_wins() {
        assert!(parse(&["--no-snapshot", "--snapshot"]).snapshot.enabled);
        assert!(!parse(&["--snapshot", "--no-snapshot"]).snapshot.enabled);
    }

    #[test]
    fn rotation_rejects_odd_angles() {
        assert!(Args::try_parse_from(["rpicam", "--rotation", "45"]).is_err());
        assert_eq!(parse(&["--rotation", "270"]).camera.rotation, Rotation::Cw270);
    }

    #[test]
    fn interval_below_minimum_is_rejected() {
        assert!(Args::try_parse_from(["rpicam", "--interval", "9"]).is_err());
        assert_eq!(parse(&["--interval", "10"]).snapshot.interval_secs, 10);
    }

    #[test]
    fn scaling_is_range_checked() {
        assert!(Args::try_parse_from(["rpicam", "--scaling", "0.1"]).is_err());
        assert_eq!(parse(&["--scaling", "0.5"]).camera.scaling, 0.5);
    }
}
