use std::collections::{HashMap, HashSet};

/// Set of hostnames classified as DEV environment, loaded alongside rules.
#[derive(Debug, Clone, Default)]
pub struct DevHosts(pub HashSet<String>);

impl DevHosts {
    pub fn contains(&self, hostname: &str) -> bool {
        self.0.contains(hostname)
    }
}

/// hostname -> team override, loaded alongside rules.
#[derive(Debug, Clone, Default)]
pub struct TeamMappings(pub HashMap<String, String>);

impl TeamMappings {
    pub fn team_for(&self, hostname: &str) -> Option<&str> {
        self.0.get(hostname).map(String::as_str)
    }
}
