//! Driver option parsing (spec §6 "Recognized driver options").
//!
//! Options arrive from the embedder as a `HashMap<String, String>`,
//! exactly as the higher-level image/container store would hand them
//! down. Keys are matched case-insensitively with an optional
//! `overlay.`/`overlay2.` prefix stripped first; unknown keys are a
//! hard error so typos don't silently do nothing.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::{Error, Result};

/// `force_mask` accepts an octal mode or one of two named presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceMask {
    Mode(u32),
    Shared,
    Private,
}

impl ForceMask {
    pub fn mode(&self) -> u32 {
        match self {
            ForceMask::Mode(m) => *m,
            ForceMask::Shared => 0o755,
            ForceMask::Private => 0o700,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    pub mount_opt: Option<String>,
    pub default_size: Option<u64>,
    pub additional_image_stores: Vec<PathBuf>,
    pub mount_program: Option<PathBuf>,
    pub skip_mount_home: bool,
    pub ignore_chown_errors: bool,
    pub force_mask: Option<ForceMask>,
}

impl DriverOptions {
    pub fn parse(raw: &HashMap<String, String>) -> Result<Self> {
        let mut opts = DriverOptions::default();
        for (key, value) in raw {
            match normalize_key(key).as_str() {
                "mountopt" => opts.mount_opt = Some(value.clone()),
                "size" => opts.default_size = Some(parse_human_size(value)?),
                "imagestore" | "additionalimagestore" => {
                    opts.additional_image_stores
                        .extend(value.split(',').filter(|s| !s.is_empty()).map(PathBuf::from));
                }
                "mount_program" => opts.mount_program = Some(PathBuf::from(value)),
                "skip_mount_home" => opts.skip_mount_home = parse_bool(key, value)?,
                "ignore_chown_errors" => opts.ignore_chown_errors = parse_bool(key, value)?,
                "force_mask" => opts.force_mask = Some(parse_force_mask(key, value)?),
                "override_kernel_check" => { /* legacy, accepted and ignored */ }
                _ => return Err(Error::UnknownOption(key.clone())),
            }
        }
        Ok(opts)
    }
}

fn normalize_key(key: &str) -> String {
    let lower = key.to_ascii_lowercase();
    lower
        .strip_prefix("overlay2.")
        .or_else(|| lower.strip_prefix("overlay."))
        .unwrap_or(&lower)
        .to_string()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidOptionValue(key.to_string(), value.to_string())),
    }
}

fn parse_force_mask(key: &str, value: &str) -> Result<ForceMask> {
    match value {
        "shared" => Ok(ForceMask::Shared),
        "private" => Ok(ForceMask::Private),
        _ => u32::from_str_radix(value, 8)
            .map(ForceMask::Mode)
            .map_err(|_| Error::InvalidOptionValue(key.to_string(), value.to_string())),
    }
}

/// Parses a human-readable byte size such as `10G`, `500M`, `2048`
/// (1024-based suffixes, case-insensitive).
pub fn parse_human_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let err = || Error::InvalidOptionValue("size".to_string(), value.to_string());

    let (digits, mult): (&str, u64) = if let Some(stripped) = value.strip_suffix(['k', 'K']) {
        (stripped, 1024)
    } else if let Some(stripped) = value.strip_suffix(['m', 'M']) {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = value.strip_suffix(['g', 'G']) {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = value.strip_suffix(['t', 'T']) {
        (stripped, 1024 * 1024 * 1024 * 1024)
    } else {
        (value, 1)
    };

    let n: u64 = digits.trim().parse().map_err(|_| err())?;
    n.checked_mul(mult).ok_or_else(err)
}

#[cfg(test)]
mod test {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_basic_options() {
        let opts = DriverOptions::parse(&map(&[
            ("overlay.mountopt", "nodev"),
            ("overlay2.size", "10G"),
            ("force_mask", "shared"),
        ]))
        .unwrap();
        assert_eq!(opts.mount_opt.as_deref(), Some("nodev"));
        assert_eq!(opts.default_size, Some(10 * 1024 * 1024 * 1024));
        assert_eq!(opts.force_mask, Some(ForceMask::Shared));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let result = DriverOptions::parse(&map(&[("bogus", "1")]));
        assert!(matches!(result, Err(Error::UnknownOption(_))));
    }

    #[test]
    fn test_override_kernel_check_ignored() {
        let opts = DriverOptions::parse(&map(&[("override_kernel_check", "true")])).unwrap();
        assert!(opts.mount_program.is_none());
    }

    #[test]
    fn test_additional_image_stores_comma_separated() {
        let opts = DriverOptions::parse(&map(&[("additionalimagestore", "/a,/b")])).unwrap();
        assert_eq!(opts.additional_image_stores, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn test_force_mask_octal() {
        let opts = DriverOptions::parse(&map(&[("force_mask", "0755")])).unwrap();
        assert_eq!(opts.force_mask.unwrap().mode(), 0o755);
    }

    #[test]
    fn test_parse_human_size() {
        assert_eq!(parse_human_size("1024").unwrap(), 1024);
        assert_eq!(parse_human_size("1K").unwrap(), 1024);
        assert_eq!(parse_human_size("2M").unwrap(), 2 * 1024 * 1024);
    }
}
