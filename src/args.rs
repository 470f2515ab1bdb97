use clap::{ArgAction, Parser};
use std::path::PathBuf;

use kmscap::config;

#[derive(Parser, Debug)]
#[command(name = "kmscap")]
#[command(version = "0.1.0")]
#[command(about = "Capture a DRM/KMS display plane as canonical RGBA frames", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kmscap.toml")]
    pub config: PathBuf,

    /// DRM device node
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Plane id to capture
    #[arg(long)]
    pub plane: Option<u32>,

    /// CRTC id to capture from
    #[arg(long)]
    pub crtc: Option<u32>,

    /// Override the detected driver (e.g. test-map-dumb)
    #[arg(long)]
    pub force_driver: Option<String>,

    /// Read VA-API surfaces through a derived image
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, value_name = "on|off")]
    pub va_derive: Option<bool>,

    /// Print VA-API image formats and relax format matching
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, value_name = "on|off")]
    pub va_list_formats: Option<bool>,

    /// Capture the hardware cursor plane
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, value_name = "on|off")]
    pub capture_cursor: Option<bool>,

    /// Sample the cursor every N frames
    #[arg(long)]
    pub cursor_frameskip: Option<u32>,

    /// Report every frame as fully changed
    #[arg(long, action = ArgAction::Set, value_parser = parse_switch, value_name = "on|off")]
    pub disable_compare: Option<bool>,

    /// Target frames per second
    #[arg(long)]
    pub fps: Option<u32>,

    /// Write one frame to this file and exit (.png writes a PNG)
    #[arg(long)]
    pub dump: Option<PathBuf>,

    /// Dump the unconverted buffer instead of RGBA
    #[arg(long, action, requires = "dump")]
    pub dump_raw: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, config::ConfigError> {
        config::Config::load(&self.config)
    }

    /// Apply command-line overrides on top of the file configuration.
    pub fn apply(&self, config: &mut config::Config) {
        let capture = &mut config.capture;
        if let Some(ref device) = self.device {
            capture.device = device.clone();
        }
        if let Some(plane) = self.plane {
            capture.plane = plane;
        }
        if let Some(crtc) = self.crtc {
            capture.crtc = crtc;
        }
        if let Some(ref driver) = self.force_driver {
            capture.force_driver = Some(driver.clone());
        }
        if let Some(skip) = self.cursor_frameskip {
            capture.cursor_frameskip = skip;
        }
        if let Some(fps) = self.fps {
            capture.fps = fps;
        }
        if let Some(derive) = self.va_derive {
            capture.va_derive = derive;
        }
        if let Some(log_formats) = self.va_list_formats {
            capture.va_list_formats = log_formats;
        }
        if let Some(cursor) = self.capture_cursor {
            capture.capture_cursor = cursor;
        }
        if let Some(disable) = self.disable_compare {
            capture.disable_compare = disable;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

/// Accept `on`/`off` alongside the usual boolean spellings.
fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(format!("expected on or off, got '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_file() {
        let args = Args::parse_from([
            "kmscap",
            "--device",
            "/dev/dri/card1",
            "--plane",
            "33",
            "--force-driver",
            "test-prime",
            "--capture-cursor",
            "on",
            "--fps",
            "60",
        ]);
        let mut cfg = config::Config::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.capture.device, PathBuf::from("/dev/dri/card1"));
        assert_eq!(cfg.capture.plane, 33);
        assert_eq!(cfg.capture.force_driver.as_deref(), Some("test-prime"));
        assert!(cfg.capture.capture_cursor);
        assert_eq!(cfg.capture.fps, 60);
        assert_eq!(cfg.capture.cursor_frameskip, 15);
    }

    #[test]
    fn switches_can_turn_file_settings_off() {
        let mut cfg = config::Config::default();
        cfg.capture.va_derive = true;
        cfg.capture.capture_cursor = true;
        cfg.capture.disable_compare = true;

        let args = Args::parse_from([
            "kmscap",
            "--va-derive",
            "off",
            "--capture-cursor",
            "false",
            "--va-list-formats",
            "on",
        ]);
        args.apply(&mut cfg);
        assert!(!cfg.capture.va_derive);
        assert!(!cfg.capture.capture_cursor);
        assert!(cfg.capture.va_list_formats);
        // Not given on the command line, so the file value stands
        assert!(cfg.capture.disable_compare);
    }

    #[test]
    fn bad_switch_value_is_rejected() {
        assert!(Args::try_parse_from(["kmscap", "--va-derive", "maybe"]).is_err());
        assert_eq!(parse_switch("ON"), Ok(true));
        assert_eq!(parse_switch("0"), Ok(false));
    }

    #[test]
    fn dump_raw_requires_dump() {
        assert!(Args::try_parse_from(["kmscap", "--dump-raw"]).is_err());
        let args = Args::try_parse_from(["kmscap", "--dump", "out.png", "--dump-raw"]).unwrap();
        assert!(args.dump_raw);
    }
}
