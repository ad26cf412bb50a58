//! Node self-description sent with the registration request
//!
//! This module handles:
//! - Host name and distribution detection
//! - Core count and memory size
//! - Network interface enumeration (IPv4/IPv6/MAC per interface, InfiniBand flag)

use crate::protocol::{NetworkInfo, RegisterRequest};
use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use std::collections::BTreeMap;
use sysinfo::System;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub hostname: String,
    pub distro: String,
    pub core_count: u32,
    pub memory_megabytes: u64,
    pub networks: Vec<NetworkInfo>,
}

impl SystemInfo {
    pub fn discover() -> Result<Self> {
        info!("Starting system discovery...");

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let distro = System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string());

        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        let core_count = sys.physical_core_count().unwrap_or(sys.cpus().len()) as u32;
        let memory_megabytes = sys.total_memory() / (1024 * 1024);

        let networks = discover_networks().context("Failed to discover network interfaces")?;
        info!(%hostname, %distro, core_count, interfaces = networks.len(), "discovery complete");

        Ok(Self { hostname, distro, core_count, memory_megabytes, networks })
    }

    pub fn registration(&self, node_name: &str) -> RegisterRequest {
        RegisterRequest {
            node_name: node_name.to_string(),
            distro_info: self.distro.clone(),
            core_count: self.core_count,
            socket_count: 1,
            memory_megabytes: self.memory_megabytes,
            networks_info: self.networks.clone(),
        }
    }
}

/// One entry per non-loopback interface, first address of each family.
fn discover_networks() -> Result<Vec<NetworkInfo>> {
    let mut by_name: BTreeMap<String, NetworkInfo> = BTreeMap::new();
    for if_addr in get_if_addrs()? {
        if if_addr.is_loopback() {
            continue;
        }
        let entry = by_name.entry(if_addr.name.clone()).or_insert_with(|| NetworkInfo {
            name: if_addr.name.clone(),
            mac_address: interface_mac(&if_addr.name),
            is_ib: is_infiniband(&if_addr.name),
            ..Default::default()
        });
        match if_addr.addr {
            IfAddr::V4(v4) if entry.ip_v4.is_empty() => entry.ip_v4 = v4.ip.to_string(),
            IfAddr::V6(v6) if entry.ip_v6.is_empty() => entry.ip_v6 = v6.ip.to_string(),
            _ => {}
        }
    }
    Ok(by_name.into_values().collect())
}

fn interface_mac(name: &str) -> String {
    match mac_address::mac_address_by_name(name) {
        Ok(Some(mac)) => mac.to_string().to_lowercase(),
        Ok(None) => String::new(),
        Err(e) => {
            debug!("Error getting MAC for {}: {}", name, e);
            String::new()
        }
    }
}

fn is_infiniband(name: &str) -> bool {
    let name = name.to_lowercase();
    name.starts_with("ib") || name.starts_with("ipoib")
}
