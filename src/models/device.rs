use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A network interface that can be captured on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Unique system name (used for capture operations)
    pub name: String,

    /// Name to show to users.
    ///
    /// Windows device names are `\Device\NPF_{GUID}`, so the description is
    /// the only readable option there.
    pub display_name: String,

    /// Driver-provided description; usually only present on Windows
    pub description: Option<String>,

    /// Whether this is the backend's default device
    pub is_preferred: bool,

    /// Whether the interface is up and running
    pub ready: bool,

    /// Whether this is a wireless interface
    pub wireless: bool,

    /// Addresses bound to the interface
    pub addresses: Vec<IpAddr>,
}

impl Device {
    /// Create a device with just a name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: None,
            is_preferred: false,
            ready: true,
            wireless: false,
            addresses: Vec::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self.display_name = friendly_name(&self.name, self.description.as_deref());
        self
    }

    /// Set the bound addresses
    pub fn with_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Mark as the preferred device
    pub fn preferred(mut self) -> Self {
        self.is_preferred = true;
        self
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

fn friendly_name(name: &str, description: Option<&str>) -> String {
    if cfg!(target_os = "windows") {
        if let Some(description) = description.filter(|d| !d.is_empty()) {
            return description.to_string();
        }
    }

    name.to_string()
}

/// Move the preferred device to the front, keeping the rest in order
pub fn sort_preferred_first(devices: &mut [Device]) {
    devices.sort_by_key(|d| !d.is_preferred);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_device_sorts_first() {
        let mut devices = vec![
            Device::new("wlan0"),
            Device::new("eth0").preferred(),
            Device::new("docker0"),
        ];
        sort_preferred_first(&mut devices);

        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["eth0", "wlan0", "docker0"]);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn display_name_is_system_name_off_windows() {
        let device = Device::new("eth0").with_description(Some("Intel Ethernet".into()));
        assert_eq!(device.display_name(), "eth0");
    }

    #[test]
    fn display_name_is_serialized() {
        let device = Device::new("eth0").with_description(Some("Intel Ethernet".into()));
        let json = serde_json::to_value(&device).unwrap();

        assert_eq!(json["display_name"], device.display_name());
        assert_eq!(json["name"], "eth0");
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn display_name_prefers_description_on_windows() {
        let device = Device::new(r"\Device\NPF_{4E273621-5161-46C8-895A-48D0E52A0B83}")
            .with_description(Some("Intel Ethernet".into()));
        assert_eq!(device.display_name(), "Intel Ethernet");
    }
}
