//! mDNS service advertisement for mesh peer discovery.
//!
//! This is best-effort - failure is logged but doesn't prevent the service from running.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use mdns_sd::{ServiceDaemon, ServiceInfo};

/// Service type under which every Senseye node advertises itself.
pub const SERVICE_TYPE: &str = "_senseye._tcp.local.";

/// Advertises this node's mesh endpoint via mDNS/DNS-SD.
///
/// When created, registers the service with the local mDNS responder.
/// The service is automatically unregistered when dropped.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: String,
    /// Tracks whether shutdown has been called to prevent double unregister.
    shutdown_called: AtomicBool,
}

impl MdnsAdvertiser {
    /// Creates and registers an mDNS service advertisement.
    ///
    /// # Arguments
    /// * `node_id` - This node's identity, carried in the TXT record and used
    ///   as the instance name so peers can match advertisements to gossip
    ///   sessions without a separate lookup.
    /// * `advertise_ip` - The IP address to advertise (should be LAN-reachable).
    /// * `port` - The mesh TCP listener port.
    ///
    /// # Errors
    /// Returns an error if the mDNS daemon cannot be created or the service
    /// cannot be registered (e.g., mDNS not available on the system).
    pub fn new(node_id: &str, advertise_ip: IpAddr, port: u16) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;

        let instance_name = node_id.to_string();
        let dns_host = format!("{}.local.", sanitize_for_dns(node_id));

        let mut txt = HashMap::new();
        txt.insert("node_id".to_string(), node_id.to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &dns_host,
            advertise_ip,
            port,
            Some(txt),
        )?;

        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;

        log::info!(
            "[mdns] advertising node '{}' at {}:{}",
            node_id,
            advertise_ip,
            port
        );

        Ok(Self {
            daemon,
            service_fullname: fullname,
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// Returns the mDNS daemon so a browse loop can be started against it.
    #[must_use]
    pub fn daemon(&self) -> &ServiceDaemon {
        &self.daemon
    }

    /// Unregisters the service from mDNS.
    ///
    /// Called automatically on drop, but can be called manually for explicit cleanup.
    /// Safe to call multiple times - subsequent calls are no-ops.
    pub fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.daemon.unregister(&self.service_fullname) {
            log::warn!("[mdns] failed to unregister service: {}", e);
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sanitize_for_dns(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_non_dns_chars() {
        assert_eq!(sanitize_for_dns("Node_01!"), "node01");
    }
}
