//! Names and constants of the OpenCC module ABI.
//!
//! The module is a WASI reactor exporting a thin C wrapper around
//! `opencc.h`. Strings cross the boundary as NUL-terminated UTF-8 in the
//! module's linear memory.

/// Allocator export, `void *malloc(size_t)`.
pub const MALLOC: &str = "malloc";
/// Deallocator export, `void free(void *)`.
pub const FREE: &str = "free";
/// `opencc_t opencc_open(const char *config)`.
pub const OPEN: &str = "opencc_open";
/// `int opencc_close(opencc_t)`.
pub const CLOSE: &str = "opencc_close";
/// `char *opencc_convert(opencc_t, const char *input)`.
pub const CONVERT: &str = "opencc_convert";
/// Releases strings returned by the convert exports.
pub const CONVERT_FREE: &str = "opencc_convert_free";
/// `const char *opencc_error(void)`, owned by the module.
pub const ERROR: &str = "opencc_error";
/// One-shot Simplified to Traditional conversion.
pub const S2T: &str = "opencc_s2t";
/// One-shot Traditional to Simplified conversion.
pub const T2S: &str = "opencc_t2s";

/// Memory export name.
pub const MEMORY: &str = "memory";
/// Reactor initializer, run once per instance when exported.
pub const INITIALIZE: &str = "_initialize";

/// `(opencc_t)-1`, returned by `opencc_open` on failure.
pub const INVALID_HANDLE: u32 = u32::MAX;

/// `argv[0]` handed to the module.
pub const PROGRAM_NAME: &str = "opencc";

/// Configuration files shipped with OpenCC.
pub mod configs {
    /// Simplified Chinese to Traditional Chinese.
    pub const S2T: &str = "s2t.json";
    /// Traditional Chinese to Simplified Chinese.
    pub const T2S: &str = "t2s.json";
    /// Simplified Chinese to Traditional Chinese (Taiwan Standard).
    pub const S2TW: &str = "s2tw.json";
    /// Traditional Chinese (Taiwan Standard) to Simplified Chinese.
    pub const TW2S: &str = "tw2s.json";
    /// Simplified Chinese to Traditional Chinese (Hong Kong variant).
    pub const S2HK: &str = "s2hk.json";
    /// Traditional Chinese (Hong Kong variant) to Simplified Chinese.
    pub const HK2S: &str = "hk2s.json";
    /// Simplified to Taiwan Standard with Taiwanese idioms.
    pub const S2TWP: &str = "s2twp.json";
    /// Taiwan Standard to Simplified with Mainland idioms.
    pub const TW2SP: &str = "tw2sp.json";
    /// Traditional Chinese to Taiwan Standard.
    pub const T2TW: &str = "t2tw.json";
    /// Traditional Chinese to Hong Kong variant.
    pub const T2HK: &str = "t2hk.json";
    /// New Japanese Kanji (Shinjitai) to Traditional Chinese.
    pub const JP2T: &str = "jp2t.json";
    /// Traditional Chinese to New Japanese Kanji (Shinjitai).
    pub const T2JP: &str = "t2jp.json";

    /// Every configuration above.
    pub const ALL: &[&str] = &[
        S2T, T2S, S2TW, TW2S, S2HK, HK2S, S2TWP, TW2SP, T2TW, T2HK, JP2T, T2JP,
    ];
}

/// Direction of the fixed one-shot conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Simplified to Traditional (`opencc_s2t`).
    SimplifiedToTraditional,
    /// Traditional to Simplified (`opencc_t2s`).
    TraditionalToSimplified,
}

impl Direction {
    /// The export performing this conversion.
    pub fn export(self) -> &'static str {
        match self {
            Direction::SimplifiedToTraditional => S2T,
            Direction::TraditionalToSimplified => T2S,
        }
    }

    /// The configuration file the export opens internally.
    pub fn config_id(self) -> &'static str {
        match self {
            Direction::SimplifiedToTraditional => configs::S2T,
            Direction::TraditionalToSimplified => configs::T2S,
        }
    }

    /// The opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Direction::SimplifiedToTraditional => Direction::TraditionalToSimplified,
            Direction::TraditionalToSimplified => Direction::SimplifiedToTraditional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_mapping() {
        let forward = Direction::SimplifiedToTraditional;
        assert_eq!(forward.export(), "opencc_s2t");
        assert_eq!(forward.config_id(), "s2t.json");
        assert_eq!(forward.reverse().export(), "opencc_t2s");
        assert_eq!(forward.reverse().reverse(), forward);
    }

    #[test]
    fn test_invalid_handle_is_minus_one() {
        assert_eq!(INVALID_HANDLE, -1i32 as u32);
        assert!(configs::ALL.iter().all(|c| c.ends_with(".json")));
    }
}
