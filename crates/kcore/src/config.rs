//! Boot-time configuration.
//!
//! Options come from the kernel command line as whitespace-separated
//! `key=value` tokens:
//!
//! | key     | value                                   | default   |
//! |---------|-----------------------------------------|-----------|
//! | `cpus`  | CPUs to bring up, `1..=MAX_CPUS`        | 8         |
//! | `hz`    | timer ticks per second, `1..=10000`     | 100       |
//! | `sched` | `trivial`                               | `trivial` |
//! | `log`   | `error`, `warn`, `info`, `debug`, `trace` | `info`  |

use log::LevelFilter;

use crate::MAX_CPUS;
use crate::error::KernelError;
use crate::sched::SchedPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_cpus: usize,
    pub tick_hz: u32,
    pub policy: SchedPolicy,
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_cpus: 8,
            tick_hz: 100,
            policy: SchedPolicy::Trivial,
            log_level: LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    /// Parses a command line on top of the defaults.
    ///
    /// Unknown keys and bare words are skipped with a warning; a known key
    /// with a bad value is an error.
    pub fn parse(cmdline: &str) -> Result<Self, KernelError> {
        let mut config = Self::default();

        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                log::warn!("config: ignoring `{}`", token);
                continue;
            };
            match key {
                "cpus" => {
                    let cpus: usize = value
                        .parse()
                        .map_err(|_| KernelError::InvalidConfig { key: "cpus" })?;
                    if cpus == 0 {
                        return Err(KernelError::InvalidConfig { key: "cpus" });
                    }
                    if cpus > MAX_CPUS {
                        return Err(KernelError::TooManyCpus {
                            requested: cpus,
                            max: MAX_CPUS,
                        });
                    }
                    config.max_cpus = cpus;
                }
                "hz" => {
                    config.tick_hz = value
                        .parse::<u32>()
                        .ok()
                        .filter(|hz| (1..=10_000).contains(hz))
                        .ok_or(KernelError::InvalidConfig { key: "hz" })?;
                }
                "sched" => {
                    config.policy = SchedPolicy::parse(value)
                        .ok_or(KernelError::InvalidConfig { key: "sched" })?;
                }
                "log" => {
                    config.log_level = value
                        .parse::<LevelFilter>()
                        .map_err(|_| KernelError::InvalidConfig { key: "log" })?;
                }
                _ => log::warn!("config: unknown option `{}`", key),
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cmdline_gives_defaults() {
        assert_eq!(KernelConfig::parse("").unwrap(), KernelConfig::default());
        assert_eq!(KernelConfig::parse("   ").unwrap(), KernelConfig::default());
    }

    #[test]
    fn known_options_override_defaults() {
        let config = KernelConfig::parse("cpus=2 hz=250 sched=trivial log=trace").unwrap();
        assert_eq!(config.max_cpus, 2);
        assert_eq!(config.tick_hz, 250);
        assert_eq!(config.policy, SchedPolicy::Trivial);
        assert_eq!(config.log_level, LevelFilter::Trace);
    }

    #[test]
    fn unknown_options_are_ignored() {
        let config = KernelConfig::parse("quiet splash=1 hz=50").unwrap();
        assert_eq!(config.tick_hz, 50);
        assert_eq!(config.max_cpus, 8);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert_eq!(
            KernelConfig::parse("hz=0"),
            Err(KernelError::InvalidConfig { key: "hz" })
        );
        assert_eq!(
            KernelConfig::parse("cpus=lots"),
            Err(KernelError::InvalidConfig { key: "cpus" })
        );
        assert_eq!(
            KernelConfig::parse("sched=cfs"),
            Err(KernelError::InvalidConfig { key: "sched" })
        );
        assert_eq!(
            KernelConfig::parse("cpus=65"),
            Err(KernelError::TooManyCpus {
                requested: 65,
                max: MAX_CPUS
            })
        );
    }
}
