//! Quick resolution presets for the Pi camera sensor modes

use serde::{Deserialize, Serialize};

use super::Resolution;

/// Resolution/framerate preset selected on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Use width, height, framerate and scaling exactly as configured
    Manual,
    /// 640x480 @ 60 fps, 1920x1440 stills
    Low,
    /// 1640x1232 @ 30 fps, 2460x1848 stills
    #[default]
    Full,
    /// 1920x1080 @ 24 fps
    Wide,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preset {
    pub video: Resolution,
    pub framerate: f64,
    pub scaling: f64,
}

impl Mode {
    pub fn preset(self) -> Option<Preset> {
        match self {
            Self::Manual => None,
            Self::Low => Some(Preset {
                video: Resolution::new(640, 480),
                framerate: 60.0,
                scaling: 3.0,
            }),
            Self::Full => Some(Preset {
                video: Resolution::new(1640, 1232),
                framerate: 30.0,
                scaling: 1.5,
            }),
            Self::Wide => Some(Preset {
                video: Resolution::new(1920, 1080),
                framerate: 24.0,
                scaling: 1.0,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Landscape,
    /// Swaps the configured width and height
    Portrait,
}

impl Orientation {
    pub fn apply(self, video: Resolution) -> Resolution {
        match self {
            Self::Landscape => video,
            Self::Portrait => video.swapped(),
        }
    }
}
