//! Configuration struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields by parsing from the given TOML string if it's not
/// `None`. Returns `Ok(config)` on success, and `Err(DiscoverdError)` on
/// parser failure or on any key that is not one of the listed fields.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => StoreConfig; instance_ttl_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::DiscoverdError> {
            let mut config: $config_type = Default::default();
            let config_str = match config_str {
                Some(s) => s,
                None => return Ok(config),
            };

            let mut table = config_str.parse::<toml::Table>()?;

            $({
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // leftover keys are not expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::DiscoverdError::Validation(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::DiscoverdError;

    #[derive(Debug, PartialEq)]
    struct TickConfig {
        ttl_ms: u64,
        domain: String,
        recursors: Vec<String>,
    }

    impl Default for TickConfig {
        fn default() -> Self {
            TickConfig {
                ttl_ms: 10000,
                domain: "discoverd.".into(),
                recursors: vec![],
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), DiscoverdError> {
        let config =
            parsed_config!(None => TickConfig; ttl_ms, domain, recursors)?;
        assert_eq!(config, TickConfig::default());
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), DiscoverdError> {
        let config_str = Some("ttl_ms = 100\nrecursors = ['8.8.8.8']");
        let config =
            parsed_config!(config_str => TickConfig; ttl_ms, recursors)?;
        assert_eq!(
            config,
            TickConfig {
                ttl_ms: 100,
                domain: "discoverd.".into(),
                recursors: vec!["8.8.8.8".into()],
            }
        );
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        let res = parsed_config!(config_str => TickConfig; ttl_ms);
        assert!(res.is_err_and(|e| e.is_validation()));
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("ttl_ms = 'soon'");
        assert!(parsed_config!(config_str => TickConfig; ttl_ms).is_err());
    }
}
