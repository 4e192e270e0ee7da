use crate::util::constants::LOG_BYTES_IN_KBYTE;

/// The default size of the main zone, in megabytes.
pub const DEFAULT_ZONE_MEGS: usize = 12;
/// The default size of the hunk, in megabytes.
pub const DEFAULT_HUNK_MEGS: usize = 56;
/// The minimum size of the hunk, in megabytes. Smaller requests are
/// clamped up so level loads always fit.
pub const MIN_HUNK_MEGS: usize = 48;
/// The fixed size of the small zone, in bytes.
pub const SMALL_ZONE_BYTES: usize = 512 << LOG_BYTES_IN_KBYTE;

/// Boot-time configuration for the memory subsystem. Each field can be
/// set through an environment variable named `TAGHEAP_` plus the
/// upper-cased field name (e.g. `TAGHEAP_HUNK_MEGS=96`), which is how the
/// engine's `com_zoneMegs`/`com_hunkMegs` knobs reach this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Size of the main zone in megabytes.
    pub zone_megs: usize,
    /// Size of the hunk in megabytes, clamped to at least `MIN_HUNK_MEGS`.
    pub hunk_megs: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            zone_megs: DEFAULT_ZONE_MEGS,
            hunk_megs: DEFAULT_HUNK_MEGS,
        }
    }
}

impl Options {
    /// Set an option from its name and a string value. Returns true if the
    /// name is known and the value parses; the validator for `hunk_megs`
    /// clamps rather than rejects, matching the engine's cvar range check.
    pub fn set_from_str(&mut self, name: &str, value: &str) -> bool {
        match name {
            "zone_megs" => match value.parse::<usize>() {
                Ok(v) if v > 0 => {
                    self.zone_megs = v;
                    true
                }
                _ => false,
            },
            "hunk_megs" => match value.parse::<usize>() {
                Ok(v) => {
                    if v < MIN_HUNK_MEGS {
                        warn!("hunk_megs {} is below the minimum, clamping to {}", v, MIN_HUNK_MEGS);
                        self.hunk_megs = MIN_HUNK_MEGS;
                    } else {
                        self.hunk_megs = v;
                    }
                    true
                }
                Err(_) => false,
            },
            _ => false,
        }
    }

    /// Read options from the environment. Unknown or invalid variables
    /// under the prefix are reported and skipped, keeping the defaults.
    pub fn from_env() -> Options {
        let mut options = Options::default();
        const PREFIX: &str = "TAGHEAP_";
        for (key, val) in std::env::vars() {
            if let Some(name) = key.strip_prefix(PREFIX) {
                let lowercase = name.to_lowercase();
                if !options.set_from_str(&lowercase, &val) {
                    warn!("unknown or invalid option {}={}", key, val);
                }
            }
        }
        options
    }
}
