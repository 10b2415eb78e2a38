//! Command-line argument parsing.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct Args {
    /// Firmware image: /I -i <file>
    pub image: Option<PathBuf>,

    /// Device selection: -d <vid>:<pid>, hexadecimal
    pub device: Option<(u16, u16)>,

    /// Expected firmware version: -v <major>.<minor>
    pub version: Option<(u8, u8)>,

    /// Show help: -h / --help
    pub help: bool,
}

#[derive(Debug)]
pub enum ArgsError {
    MissingValue(&'static str),
    InvalidDevice(String),
    InvalidVersion(String),
    Unknown(String),
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingValue(flag) => write!(f, "{flag} needs a value"),
            Self::InvalidDevice(value) => {
                write!(f, "invalid device '{value}', expected hex vid:pid")
            }
            Self::InvalidVersion(value) => {
                write!(f, "invalid version '{value}', expected major.minor")
            }
            Self::Unknown(flag) => write!(f, "unknown option '{flag}'"),
        }
    }
}

impl std::error::Error for ArgsError {}

impl Args {
    pub fn parse() -> Result<Self, ArgsError> {
        Self::from_iter(std::env::args().skip(1))
    }

    pub fn from_iter(mut iter: impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut args = Self::default();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-i" => {
                    let value = iter.next().ok_or(ArgsError::MissingValue("-i"))?;
                    args.image = Some(PathBuf::from(value));
                }
                "-d" => {
                    let value = iter.next().ok_or(ArgsError::MissingValue("-d"))?;
                    args.device = Some(parse_device(&value)?);
                }
                "-v" => {
                    let value = iter.next().ok_or(ArgsError::MissingValue("-v"))?;
                    args.version = Some(parse_version(&value)?);
                }
                "-h" | "--help" => args.help = true,
                other => return Err(ArgsError::Unknown(other.to_string())),
            }
        }
        Ok(args)
    }
}

fn parse_device(value: &str) -> Result<(u16, u16), ArgsError> {
    let invalid = || ArgsError::InvalidDevice(value.to_string());
    let (vid, pid) = value.split_once(':').ok_or_else(invalid)?;
    let vid = u16::from_str_radix(vid.trim_start_matches("0x"), 16).map_err(|_| invalid())?;
    let pid = u16::from_str_radix(pid.trim_start_matches("0x"), 16).map_err(|_| invalid())?;
    Ok((vid, pid))
}

/// Versions compare against the device's BCD `bcdDevice`, so "2.21" becomes
/// (0x02, 0x21).
fn parse_version(value: &str) -> Result<(u8, u8), ArgsError> {
    let invalid = || ArgsError::InvalidVersion(value.to_string());
    let (major, minor) = value.split_once('.').ok_or_else(invalid)?;
    let major = u8::from_str_radix(major, 16).map_err(|_| invalid())?;
    let minor = u8::from_str_radix(minor, 16).map_err(|_| invalid())?;
    Ok((major, minor))
}
