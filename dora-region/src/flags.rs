use std::env;
use std::ops::Deref;

use thiserror::Error;

use crate::gc::{G, K, M};

/// Environment variable consulted by `RegionFlags::from_env`.
pub const ENV_VAR: &str = "DORA_REGION";

pub const DEFAULT_BLOCK_SIZE: usize = 8 * K;
pub const DEFAULT_LINE_SIZE: usize = 128;
pub const DEFAULT_LARGE_OBJECT_THRESHOLD: usize = 2 * K;
pub const DEFAULT_ARENA_SIZE: usize = 64 * M;
pub const DEFAULT_MAX_REGION_MEMORY: usize = 4 * G;
pub const DEFAULT_LOCAL_FREE_BLOCKS: usize = 4;

// Objects need at least a header word and one field.
const MIN_LINE_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemSize(pub usize);

impl Deref for MemSize {
    type Target = usize;

    fn deref(&self) -> &usize {
        &self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagsError {
    #[error("unknown region option '{0}'")]
    UnknownOption(String),
    #[error("'{value}' is not a valid value for '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("'{key}' needs to be a power of two, got {value}")]
    NotPowerOfTwo { key: &'static str, value: usize },
    #[error("line size {line_size} is too small or exceeds block size {block_size}")]
    LineSize { line_size: usize, block_size: usize },
    #[error("large object threshold {threshold} needs to fit into half a block of {block_size}")]
    Threshold { threshold: usize, block_size: usize },
    #[error("arena size {arena_size} needs to hold at least two blocks of {block_size}")]
    ArenaSize { arena_size: usize, block_size: usize },
}

#[derive(Clone, Debug)]
pub struct RegionFlags {
    pub enabled: bool,
    pub block_size: usize,
    pub line_size: usize,
    pub large_object_threshold: usize,
    pub arena_size: usize,
    pub max_region_memory: usize,
    pub local_free_blocks: usize,
    pub gc_workers: usize,
    pub gc_verbose: bool,
    pub gc_stats: bool,
    pub gc_verify: bool,
    pub profile: bool,
    pub poison: bool,
}

impl Default for RegionFlags {
    fn default() -> RegionFlags {
        RegionFlags {
            enabled: false,
            block_size: DEFAULT_BLOCK_SIZE,
            line_size: DEFAULT_LINE_SIZE,
            large_object_threshold: DEFAULT_LARGE_OBJECT_THRESHOLD,
            arena_size: DEFAULT_ARENA_SIZE,
            max_region_memory: DEFAULT_MAX_REGION_MEMORY,
            local_free_blocks: DEFAULT_LOCAL_FREE_BLOCKS,
            gc_workers: 0,
            gc_verbose: false,
            gc_stats: false,
            gc_verify: false,
            profile: false,
            poison: cfg!(debug_assertions),
        }
    }
}

impl RegionFlags {
    /// Default configuration with regions switched on.
    pub fn enabled() -> RegionFlags {
        RegionFlags {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn from_env() -> Result<RegionFlags, FlagsError> {
        match env::var(ENV_VAR) {
            Ok(value) => RegionFlags::parse(&value),
            Err(_) => Ok(RegionFlags::default()),
        }
    }

    /// Parses a comma separated option list, e.g.
    /// `enabled,block-size=16k,line-size=256,gc-verbose`.
    pub fn parse(options: &str) -> Result<RegionFlags, FlagsError> {
        let mut flags = RegionFlags::default();

        for option in options.split(',') {
            let option = option.trim();

            if option.is_empty() {
                continue;
            }

            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (option, None),
            };

            flags.set(key, value)?;
        }

        flags.validate()?;
        Ok(flags)
    }

    fn set(&mut self, key: &str, value: Option<&str>) -> Result<(), FlagsError> {
        match key {
            "enabled" => self.enabled = parse_bool(key, value)?,
            "gc-verbose" => self.gc_verbose = parse_bool(key, value)?,
            "gc-stats" => self.gc_stats = parse_bool(key, value)?,
            "gc-verify" => self.gc_verify = parse_bool(key, value)?,
            "profile" => self.profile = parse_bool(key, value)?,
            "poison" => self.poison = parse_bool(key, value)?,
            "block-size" => self.block_size = *parse_mem_option(key, value)?,
            "line-size" => self.line_size = *parse_mem_option(key, value)?,
            "large-object-threshold" => {
                self.large_object_threshold = *parse_mem_option(key, value)?
            }
            "arena-size" => self.arena_size = *parse_mem_option(key, value)?,
            "max-region-memory" => self.max_region_memory = *parse_mem_option(key, value)?,
            "local-free-blocks" => self.local_free_blocks = parse_number(key, value)?,
            "gc-workers" => self.gc_workers = parse_number(key, value)?,
            _ => return Err(FlagsError::UnknownOption(key.to_string())),
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), FlagsError> {
        for (key, value) in [
            ("block-size", self.block_size),
            ("line-size", self.line_size),
            ("arena-size", self.arena_size),
        ] {
            if !value.is_power_of_two() {
                return Err(FlagsError::NotPowerOfTwo { key, value });
            }
        }

        if self.line_size < MIN_LINE_SIZE || self.line_size > self.block_size {
            return Err(FlagsError::LineSize {
                line_size: self.line_size,
                block_size: self.block_size,
            });
        }

        if self.large_object_threshold > self.block_size / 2 {
            return Err(FlagsError::Threshold {
                threshold: self.large_object_threshold,
                block_size: self.block_size,
            });
        }

        if self.arena_size < 2 * self.block_size {
            return Err(FlagsError::ArenaSize {
                arena_size: self.arena_size,
                block_size: self.block_size,
            });
        }

        Ok(())
    }

    pub fn gc_workers(&self) -> usize {
        if self.gc_workers != 0 {
            self.gc_workers
        } else {
            num_cpus::get().max(1)
        }
    }
}

fn parse_bool(key: &str, value: Option<&str>) -> Result<bool, FlagsError> {
    match value {
        None | Some("1") | Some("true") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("off") => Ok(false),
        Some(value) => Err(invalid(key, value)),
    }
}

fn parse_number(key: &str, value: Option<&str>) -> Result<usize, FlagsError> {
    let value = value.ok_or_else(|| invalid(key, ""))?;
    value.parse::<usize>().map_err(|_| invalid(key, value))
}

fn parse_mem_option(key: &str, value: Option<&str>) -> Result<MemSize, FlagsError> {
    let value = value.ok_or_else(|| invalid(key, ""))?;
    parse_mem_size(value).map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> FlagsError {
    FlagsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

pub fn parse_mem_size(value: &str) -> Result<MemSize, String> {
    let suffix = if let Some(ch) = value.chars().last() {
        match ch {
            'k' | 'K' => 1024,
            'm' | 'M' => 1024 * 1024,
            'g' | 'G' => 1024 * 1024 * 1024,
            _ => 1,
        }
    } else {
        1
    };

    let prefix = if suffix != 1 {
        let (left, _) = value.split_at(value.len() - 1);
        left
    } else {
        value
    };

    match prefix.parse::<usize>() {
        Ok(size) => Ok(MemSize(size * suffix)),
        Err(_) => Err(format!("'{}' is not a valid mem size", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_opt_in() {
        let flags = RegionFlags::default();
        assert!(!flags.enabled);
        assert_eq!(flags.block_size, 8 * K);
        assert_eq!(flags.line_size, 128);
        assert_eq!(flags.large_object_threshold, 2 * K);
        assert!(flags.validate().is_ok());
    }

    #[test]
    fn parse_option_list() {
        let flags =
            RegionFlags::parse("enabled, block-size=16k,line-size=256,gc-verbose,profile=0")
                .expect("valid options");
        assert!(flags.enabled);
        assert!(flags.gc_verbose);
        assert!(!flags.profile);
        assert_eq!(flags.block_size, 16 * K);
        assert_eq!(flags.line_size, 256);
    }

    #[test]
    fn parse_empty_list() {
        let flags = RegionFlags::parse("").expect("valid options");
        assert!(!flags.enabled);
    }

    #[test]
    fn reject_unknown_option() {
        assert_eq!(
            RegionFlags::parse("enabled,fast").unwrap_err(),
            FlagsError::UnknownOption("fast".into())
        );
    }

    #[test]
    fn reject_invalid_layout() {
        assert_eq!(
            RegionFlags::parse("block-size=12k").unwrap_err(),
            FlagsError::NotPowerOfTwo {
                key: "block-size",
                value: 12 * K
            }
        );

        assert!(matches!(
            RegionFlags::parse("line-size=16k").unwrap_err(),
            FlagsError::LineSize { .. }
        ));

        assert!(matches!(
            RegionFlags::parse("large-object-threshold=8k").unwrap_err(),
            FlagsError::Threshold { .. }
        ));

        assert!(matches!(
            RegionFlags::parse("block-size=foo").unwrap_err(),
            FlagsError::InvalidValue { .. }
        ));
    }

    #[test]
    fn mem_size_suffixes() {
        assert_eq!(*parse_mem_size("12").unwrap(), 12);
        assert_eq!(*parse_mem_size("2k").unwrap(), 2 * K);
        assert_eq!(*parse_mem_size("3M").unwrap(), 3 * M);
        assert_eq!(*parse_mem_size("1g").unwrap(), G);
        assert!(parse_mem_size("k").is_err());
    }
}
