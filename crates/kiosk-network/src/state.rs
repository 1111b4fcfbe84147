//! Target state for the portal network and service config rendering.

use std::{fmt::Write as _, net::Ipv4Addr, path::PathBuf};

use serde::{Deserialize, Serialize};

/// What `apply` should bring the host to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkServiceState {
    /// Wireless interface that serves the access point.
    pub interface: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub ssid: String,
    /// WPA2 passphrase; `None` runs an open network.
    pub passphrase: Option<String>,
    pub channel: u8,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
    /// dnsmasq lease time, e.g. `12h`.
    pub dhcp_lease: String,
    /// Local port that web traffic is redirected to.
    pub portal_port: u16,
    /// Where rendered config files are written.
    pub runtime_dir: PathBuf,
}

impl Default for NetworkServiceState {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            address: Ipv4Addr::new(192, 168, 4, 1),
            prefix_len: 24,
            ssid: "CaptivePortal".to_string(),
            passphrase: None,
            channel: 6,
            dhcp_start: Ipv4Addr::new(192, 168, 4, 10),
            dhcp_end: Ipv4Addr::new(192, 168, 4, 100),
            dhcp_lease: "12h".to_string(),
            portal_port: 8080,
            runtime_dir: PathBuf::from("/run/kiosk"),
        }
    }
}

impl NetworkServiceState {
    /// Address in `ip addr add` form, e.g. `192.168.4.1/24`.
    #[must_use]
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }

    /// Dotted netmask for the prefix length.
    #[must_use]
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::from(self.prefix_len.min(32));
        let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
        Ipv4Addr::from(mask)
    }

    /// `ip:port` that redirected web traffic lands on.
    #[must_use]
    pub fn portal_destination(&self) -> String {
        format!("{}:{}", self.address, self.portal_port)
    }

    #[must_use]
    pub fn hostapd_path(&self) -> PathBuf {
        self.runtime_dir.join("hostapd.conf")
    }

    #[must_use]
    pub fn dnsmasq_path(&self) -> PathBuf {
        self.runtime_dir.join("dnsmasq.conf")
    }

    /// hostapd configuration for the access point.
    #[must_use]
    pub fn render_hostapd(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "interface={}", self.interface);
        out.push_str("driver=nl80211\n");
        let _ = writeln!(out, "ssid={}", self.ssid);
        out.push_str("hw_mode=g\n");
        let _ = writeln!(out, "channel={}", self.channel);
        out.push_str("auth_algs=1\n");
        out.push_str("ignore_broadcast_ssid=0\n");
        out.push_str("wmm_enabled=0\n");
        if let Some(passphrase) = &self.passphrase {
            out.push_str("wpa=2\n");
            let _ = writeln!(out, "wpa_passphrase={passphrase}");
            out.push_str("wpa_key_mgmt=WPA-PSK\n");
            out.push_str("rsn_pairwise=CCMP\n");
        }
        out
    }

    /// dnsmasq configuration. Every DNS name resolves to the portal.
    #[must_use]
    pub fn render_dnsmasq(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "interface={}", self.interface);
        out.push_str("bind-interfaces\n");
        let _ = writeln!(out, "listen-address={}", self.address);
        let _ = writeln!(
            out,
            "dhcp-range={},{},{},{}",
            self.dhcp_start,
            self.dhcp_end,
            self.netmask(),
            self.dhcp_lease
        );
        let _ = writeln!(out, "dhcp-option=3,{}", self.address);
        let _ = writeln!(out, "dhcp-option=6,{}", self.address);
        let _ = writeln!(out, "address=/#/{}", self.address);
        out.push_str("no-resolv\n");
        out.push_str("keep-in-foreground\n");
        out
    }
}
