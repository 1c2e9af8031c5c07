//! Mount options
//!
//! Options arrive as one comma-separated string, the way a mount(8) option
//! list does:
//!
//! ```text
//! bs=2048,session=0,anchor=256,lastblock=1000,strict,ro,novrs,cache=smart
//! ```
//!
//! `uid`, `gid`, `umask`, `mode` and `dmode` are parsed and carried for the
//! layers above the mount pipeline; nothing here interprets them.

use std::str::FromStr;

use crate::cache::{CacheConfig, CachePolicy};
use crate::error::{Result, UdfError};

/// Options controlling one mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Logical block size; negotiated when unset
    pub block_size: Option<u32>,
    /// First block of the session to mount
    pub session: Option<u64>,
    /// Anchor block tried before the standard locations
    pub anchor: Option<u64>,
    /// Last block override
    pub last_block: Option<u64>,
    /// Treat conformance problems as errors instead of working around them
    pub strict: bool,
    /// Read-only mount (default)
    pub read_only: bool,
    /// Skip the volume recognition sequence check
    pub novrs: bool,
    /// Block cache; `None` reads directly
    pub cache: Option<CacheConfig>,
    /// Owner override
    pub uid: Option<u32>,
    /// Group override
    pub gid: Option<u32>,
    /// Permission mask
    pub umask: Option<u16>,
    /// File mode override
    pub mode: Option<u16>,
    /// Directory mode override
    pub dmode: Option<u16>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            block_size: None,
            session: None,
            anchor: None,
            last_block: None,
            strict: false,
            read_only: true,
            novrs: false,
            cache: None,
            uid: None,
            gid: None,
            umask: None,
            mode: None,
            dmode: None,
        }
    }
}

impl MountOptions {
    /// Parse a comma-separated option string
    pub fn parse(options: &str) -> Result<Self> {
        let mut parsed = Self::default();
        for item in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (item, None),
            };
            match (key, value) {
                ("bs", Some(v)) => {
                    let size: u32 = number(item, v)?;
                    if !matches!(size, 512 | 1024 | 2048 | 4096) {
                        return Err(UdfError::InvalidOption(item.to_string()));
                    }
                    parsed.block_size = Some(size);
                }
                ("session", Some(v)) => parsed.session = Some(number(item, v)?),
                ("anchor", Some(v)) => parsed.anchor = Some(number(item, v)?),
                ("lastblock", Some(v)) => parsed.last_block = Some(number(item, v)?),
                ("strict", None) => parsed.strict = true,
                ("nostrict", None) => parsed.strict = false,
                ("ro", None) => parsed.read_only = true,
                ("rw", None) => parsed.read_only = false,
                ("novrs", None) => parsed.novrs = true,
                ("cache", None) => parsed.cache = Some(CacheConfig::default()),
                ("cache", Some(v)) => {
                    parsed.cache = Some(CacheConfig::with_policy(v.parse::<CachePolicy>()?))
                }
                ("nocache", None) => parsed.cache = None,
                ("uid", Some(v)) => parsed.uid = Some(number(item, v)?),
                ("gid", Some(v)) => parsed.gid = Some(number(item, v)?),
                ("umask", Some(v)) => parsed.umask = Some(octal(item, v)?),
                ("mode", Some(v)) => parsed.mode = Some(octal(item, v)?),
                ("dmode", Some(v)) => parsed.dmode = Some(octal(item, v)?),
                _ => return Err(UdfError::InvalidOption(item.to_string())),
            }
        }
        Ok(parsed)
    }

    /// Session start, defaulting to 0
    pub fn session_start(&self) -> u64 {
        self.session.unwrap_or(0)
    }
}

impl FromStr for MountOptions {
    type Err = UdfError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn number<T: FromStr>(item: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| UdfError::InvalidOption(item.to_string()))
}

fn octal(item: &str, value: &str) -> Result<u16> {
    u16::from_str_radix(value, 8).map_err(|_| UdfError::InvalidOption(item.to_string()))
}
