use crate::util::constants::*;
use crate::util::error::OptionError;
use strum_macros::{Display, EnumString};

/// When a full collection compacts the old space instead of sweeping it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
pub enum CompactionPolicy {
    /// Always sweep in place.
    Never,
    /// Compact on every full collection.
    Always,
    /// Compact when the free list holds more than `fragmentation_threshold`
    /// percent of the free old space, or when young survivors would not fit.
    WhenFragmented,
}

/// The environment variable prefix for options, e.g. `GENHEAP_YOUNG_SIZE`.
pub const ENV_PREFIX: &str = "GENHEAP_";

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),*) => [
        /// Heap configuration. Every field can be set by name through
        /// [`Options::set_from_str`] or from a `GENHEAP_<NAME>` environment variable.
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }

        impl Options {
            /// Set an option by its name. The value is parsed and validated
            /// before it is stored; on error the option keeps its old value.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> Result<(), OptionError> {
                match s {
                    $(stringify!($name) => {
                        let parsed = val.parse::<$type>().map_err(|_| OptionError::ParseError {
                            name: s.to_string(),
                            value: val.to_string(),
                        })?;
                        let validate_fn = $validator;
                        if validate_fn(&parsed) {
                            self.$name = parsed;
                            Ok(())
                        } else {
                            Err(OptionError::InvalidValue {
                                name: s.to_string(),
                                value: val.to_string(),
                            })
                        }
                    })*
                    _ => Err(OptionError::UnknownOption(s.to_string())),
                }
            }

            /// Names of every option, for diagnostics.
            pub fn names() -> &'static [&'static str] {
                &[$(stringify!($name)),*]
            }
        }

        impl Default for Options {
            fn default() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
    ]
}

options! {
    /// Capacity of the young space in bytes.
    young_size:               usize            [|v: &usize| *v >= BYTES_IN_PAGE] = 4 << LOG_BYTES_IN_MBYTE,
    /// Capacity of the old space in bytes.
    old_size:                 usize            [|v: &usize| *v >= BYTES_IN_PAGE] = 16 << LOG_BYTES_IN_MBYTE,
    /// Capacity of the large object space in bytes.
    los_size:                 usize            [|v: &usize| *v >= BYTES_IN_PAGE] = 16 << LOG_BYTES_IN_MBYTE,
    /// Size of a thread-local allocation buffer.
    tlab_size:                usize            [|v: &usize| *v >= 16 * BYTES_IN_WORD && *v % BYTES_IN_WORD == 0] = DEFAULT_TLAB_SIZE,
    /// Objects of at least this many bytes are allocated in the large object space.
    large_object_threshold:   usize            [|v: &usize| *v >= 4 * BYTES_IN_WORD] = DEFAULT_LARGE_OBJECT_THRESHOLD,
    /// Card size in bytes. Must be a power of two.
    card_size:                usize            [|v: &usize| v.is_power_of_two() && *v >= BYTES_IN_WORD] = DEFAULT_CARD_SIZE,
    /// Number of marking threads in a full collection.
    gc_threads:               usize            [|v: &usize| *v > 0] = num_cpus::get(),
    /// Whether full collections compact the old space.
    compaction:               CompactionPolicy [always_valid] = CompactionPolicy::WhenFragmented,
    /// Percentage of free old space held in the free list that triggers compaction.
    fragmentation_threshold:  usize            [|v: &usize| *v <= 100] = 25,
    /// Maximum number of forwarding entries compaction may allocate. Above it the
    /// collection falls back to sweeping in place.
    compaction_scratch_limit: usize            [always_valid] = usize::MAX,
    /// Should finalization be disabled?
    no_finalizer:             bool             [always_valid] = false,
    /// Should reference type processing be disabled? Reference objects then hold their referents strongly.
    no_reference_types:       bool             [always_valid] = false,
    /// Should we ignore GCs requested by the user?
    ignore_system_gc:         bool             [always_valid] = false,
    /// Should a full GC be performed when the user requests a GC?
    full_heap_system_gc:      bool             [always_valid] = true,
    /// How frequent (every X bytes) should we do a stress GC?
    stress_factor:            usize            [always_valid] = DEFAULT_STRESS_FACTOR,
    /// How long `request_suspend` waits for the target to reach a GC-safe state.
    suspend_timeout_ms:       u64              [|v: &u64| *v > 0] = 10_000,
    /// Verify the heap before and after every collection.
    verify_heap:              bool             [always_valid] = false,
    /// Log every collection at info level.
    log_gc:                   bool             [always_valid] = false,
}

impl Options {
    /// Read options from `GENHEAP_`-prefixed environment variables. Invalid
    /// values are reported and ignored so that a bad environment does not
    /// prevent the runtime from starting.
    pub fn read_env_var_settings(&mut self) {
        for (key, val) in std::env::vars() {
            if let Some(rest_of_key) = key.strip_prefix(ENV_PREFIX) {
                let lowercase: &str = &rest_of_key.to_lowercase();
                if Self::names().contains(&lowercase) {
                    if let Err(e) = self.set_from_str(lowercase, &val) {
                        warn!("Ignoring environment variable {}: {}", key, e);
                    }
                }
            }
        }
    }

    /// Set multiple options from a whitespace separated `name=value` list.
    pub fn set_bulk_from_command_line(&mut self, options: &str) -> Result<(), OptionError> {
        for opt in options.split_ascii_whitespace() {
            let kv: Vec<&str> = opt.splitn(2, '=').collect();
            if kv.len() != 2 {
                return Err(OptionError::ParseError {
                    name: opt.to_string(),
                    value: String::new(),
                });
            }
            self.set_from_str(kv[0], kv[1])?;
        }
        Ok(())
    }
}
