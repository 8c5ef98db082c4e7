//! Declarative helpers for the protocol's closed enumerations.

/// Defines `CommandType` with lookups from the raw wire code.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Tuya command codes carried in the frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $val),*
        }

        impl CommandType {
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($val => Some(CommandType::$name),)*
                    _ => None,
                }
            }

            pub fn code(self) -> u32 {
                self as u32
            }
        }
    };
}

/// Defines the protocol `Generation` enum with its textual form.
macro_rules! define_generation {
    ($($name:ident = $text:literal),* $(,)?) => {
        /// Supported local protocol generations.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Generation {
            $($name),*
        }

        impl Generation {
            pub const ALL: &'static [Generation] = &[$(Generation::$name),*];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Generation::$name => $text,)*
                }
            }

            pub fn as_bytes(self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::str::FromStr for Generation {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok(Generation::$name),)*
                    other => Err($crate::error::TuyaError::Config(format!(
                        "unsupported protocol version '{}'",
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for Generation {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
