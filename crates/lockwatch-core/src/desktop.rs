//! Desktop environment to screensaver bus mapping.
//!
//! The signal interface/member pairs are fixed; changing them breaks
//! compatibility with the desktops that emit them.

use serde::{Deserialize, Serialize};

/// Environment variable naming the running desktop(s), colon separated.
pub const DESKTOP_ENV_VAR: &str = "XDG_CURRENT_DESKTOP";

/// Desktop environments with a known screensaver bus interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesktopEnvironment {
    Gnome,
    Unity,
    Kde,
    Cinnamon,
}

/// Where to listen for lock changes and where to ask for the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSaverBus {
    /// Interface of the `ActiveChanged` signal.
    pub interface: &'static str,
    /// Signal member name.
    pub member: &'static str,
    /// Bus name that answers `GetActive`.
    pub service: &'static str,
    /// Object path that answers `GetActive`.
    pub path: &'static str,
    /// Interface that declares `GetActive`.
    pub query_interface: &'static str,
}

impl DesktopEnvironment {
    /// Parse a desktop name, or a colon separated list as found in
    /// `XDG_CURRENT_DESKTOP` (first recognised entry wins).
    ///
    /// Unknown or empty names fall back to GNOME.
    pub fn from_name(name: &str) -> Self {
        name.split(':')
            .find_map(Self::from_component)
            .unwrap_or(DesktopEnvironment::Gnome)
    }

    fn from_component(component: &str) -> Option<Self> {
        match component.trim().to_ascii_lowercase().as_str() {
            "gnome" | "gnome-classic" | "gnome-flashback" => Some(DesktopEnvironment::Gnome),
            "unity" => Some(DesktopEnvironment::Unity),
            "kde" | "plasma" => Some(DesktopEnvironment::Kde),
            "cinnamon" | "x-cinnamon" => Some(DesktopEnvironment::Cinnamon),
            _ => None,
        }
    }

    /// Read the desktop from `XDG_CURRENT_DESKTOP`.
    pub fn detect() -> Self {
        Self::from_name(&std::env::var(DESKTOP_ENV_VAR).unwrap_or_default())
    }

    pub fn bus(self) -> ScreenSaverBus {
        match self {
            DesktopEnvironment::Gnome => ScreenSaverBus {
                interface: "org.gnome.ScreenSaver",
                member: "ActiveChanged",
                service: "org.gnome.ScreenSaver",
                path: "/org/gnome/ScreenSaver",
                query_interface: "org.gnome.ScreenSaver",
            },
            // Unity locks through gnome-screensaver.
            DesktopEnvironment::Unity => ScreenSaverBus {
                interface: "com.canonical.Unity",
                member: "ActiveChanged",
                service: "org.gnome.ScreenSaver",
                path: "/org/gnome/ScreenSaver",
                query_interface: "org.gnome.ScreenSaver",
            },
            DesktopEnvironment::Kde => ScreenSaverBus {
                interface: "org.kde.screensaver",
                member: "ActiveChanged",
                service: "org.freedesktop.ScreenSaver",
                path: "/ScreenSaver",
                query_interface: "org.freedesktop.ScreenSaver",
            },
            DesktopEnvironment::Cinnamon => ScreenSaverBus {
                interface: "org.Cinnamon.ScreenSaver",
                member: "ActiveChanged",
                service: "org.cinnamon.ScreenSaver",
                path: "/org/cinnamon/ScreenSaver",
                query_interface: "org.cinnamon.ScreenSaver",
            },
        }
    }
}
