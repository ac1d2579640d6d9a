/// Connection profile used when a platform is not in the table.
pub const DEFAULT_PROFILE: &str = "cisco_ios";

/// Substring → profile table. Order matters: the first key contained in the
/// lower-cased platform name wins.
const PLATFORM_PROFILES: &[(&str, &str)] = &[
    ("ios", "cisco_ios"),
    ("cisco_ios", "cisco_ios"),
    ("nxos", "cisco_nxos"),
    ("cisco_nxos", "cisco_nxos"),
    ("asa", "cisco_asa"),
    ("cisco_asa", "cisco_asa"),
    ("xe", "cisco_xe"),
    ("cisco_xe", "cisco_xe"),
    ("xr", "cisco_xr"),
    ("cisco_xr", "cisco_xr"),
    ("junos", "juniper_junos"),
    ("juniper", "juniper_junos"),
    ("juniper_junos", "juniper_junos"),
    ("arista", "arista_eos"),
    ("eos", "arista_eos"),
    ("arista_eos", "arista_eos"),
    ("hp", "hp_comware"),
    ("comware", "hp_comware"),
    ("hp_comware", "hp_comware"),
];

/// Look up the connection profile for an inventory platform name.
pub fn lookup_profile(platform: &str) -> Option<&'static str> {
    let platform = platform.to_lowercase();
    PLATFORM_PROFILES
        .iter()
        .find(|(key, _)| platform.contains(key))
        .map(|(_, profile)| *profile)
}

/// Like `lookup_profile`, falling back to `DEFAULT_PROFILE`.
///
/// The boolean is false when the fallback was used.
pub fn resolve_profile(platform: &str) -> (&'static str, bool) {
    match lookup_profile(platform) {
        Some(profile) => (profile, true),
        None => (DEFAULT_PROFILE, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_platforms() {
        assert_eq!(lookup_profile("Cisco IOS"), Some("cisco_ios"));
        assert_eq!(lookup_profile("cisco_nxos"), Some("cisco_nxos"));
        assert_eq!(lookup_profile("Juniper JunOS"), Some("juniper_junos"));
        assert_eq!(lookup_profile("Arista EOS"), Some("arista_eos"));
        assert_eq!(lookup_profile("HP Comware"), Some("hp_comware"));
    }

    #[test]
    fn first_matching_key_wins() {
        // "cisco ios xe" contains "ios" before "xe" is considered.
        assert_eq!(lookup_profile("Cisco IOS XE"), Some("cisco_ios"));
        assert_eq!(lookup_profile("cisco_xe"), Some("cisco_xe"));
    }

    #[test]
    fn unknown_platform_falls_back() {
        assert_eq!(lookup_profile("unknown"), None);
        assert_eq!(resolve_profile("mikrotik"), (DEFAULT_PROFILE, false));
        assert_eq!(resolve_profile("cisco_asa"), ("cisco_asa", true));
    }
}
