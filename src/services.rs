use std::collections::HashMap;
use std::ops::RangeInclusive;

/// TCP port range the game servers are known to listen on. A flow whose
/// source port falls in this range is server→client; otherwise its
/// destination port must.
pub const SERVICE_PORT_RANGE: RangeInclusive<u16> = 9000..=9600;

/// Immutable port → service-name map, populated once at startup.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: HashMap<u16, String>,
}

impl ServiceRegistry {
    pub fn new(entries: impl IntoIterator<Item = (u16, String)>) -> Self {
        ServiceRegistry {
            services: entries.into_iter().collect(),
        }
    }

    /// The stock service map used when the config does not override it.
    pub fn defaults() -> Self {
        Self::new(
            [
                (9000, "Account"),
                (9311, "AccountLog"),
                (9411, "Character"),
                (9511, "GameLog"),
                (9010, "Login"),
                (9110, "WorldManager"),
                (9210, "Zone00"),
                (9212, "Zone01"),
                (9214, "Zone02"),
                (9216, "Zone03"),
                (9218, "Zone04"),
            ]
            .into_iter()
            .map(|(port, name)| (port, name.to_string())),
        )
    }

    pub fn name(&self, port: u16) -> Option<&str> {
        self.services.get(&port).map(String::as_str)
    }

    /// Whether `port` could belong to a game server at all.
    pub fn is_service_port(port: u16) -> bool {
        SERVICE_PORT_RANGE.contains(&port)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_known_services() {
        let reg = ServiceRegistry::defaults();
        assert_eq!(reg.name(9000), Some("Account"));
        assert_eq!(reg.name(9010), Some("Login"));
        assert_eq!(reg.name(9218), Some("Zone04"));
        assert_eq!(reg.len(), 11);
    }

    #[test]
    fn unknown_port_has_no_name() {
        let reg = ServiceRegistry::defaults();
        assert_eq!(reg.name(9001), None);
        assert_eq!(reg.name(80), None);
    }

    #[test]
    fn service_port_range_boundaries() {
        assert!(ServiceRegistry::is_service_port(9000));
        assert!(ServiceRegistry::is_service_port(9600));
        assert!(!ServiceRegistry::is_service_port(8999));
        assert!(!ServiceRegistry::is_service_port(9601));
    }

    #[test]
    fn config_entries_override_defaults() {
        let reg = ServiceRegistry::new([(9300, "Custom".to_string())]);
        assert_eq!(reg.name(9300), Some("Custom"));
        assert_eq!(reg.name(9000), None);
    }
}
