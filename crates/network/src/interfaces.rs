//! Listen address selection from local interfaces

use std::collections::HashSet;
use std::net::IpAddr;

use crate::NetworkError;

/// Interface name prefixes that are never worth listening on: container
/// bridges, CNI overlays, tunnels and loopback.
pub const DEFAULT_FILTERED_INTERFACES: &[&str] = &[
    "docker", "cni", "flannel", "cilium", "vxlan", "veth", "tunl", "kube-ipvs", "edgemesh", "lo",
];

/// IPv4 addresses of the interfaces the tunnel should listen on.
///
/// `listen_interfaces` and `extra_filtered` are comma-separated. A non-empty
/// `listen_interfaces` selects exactly those interfaces (unknown names are an
/// error); otherwise every interface not matching a filtered prefix is used.
pub fn get_ips_from_interfaces(
    listen_interfaces: &str,
    extra_filtered: &str,
) -> Result<Vec<IpAddr>, NetworkError> {
    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| NetworkError::Interfaces(e.to_string()))?
        .into_iter()
        .map(|iface| {
            let ip = iface.ip();
            (iface.name, ip)
        })
        .collect::<Vec<_>>();
    select_interface_ips(&interfaces, listen_interfaces, extra_filtered)
}

/// Selection logic of [`get_ips_from_interfaces`] over an explicit interface list
pub fn select_interface_ips(
    interfaces: &[(String, IpAddr)],
    listen_interfaces: &str,
    extra_filtered: &str,
) -> Result<Vec<IpAddr>, NetworkError> {
    let wanted = split_list(listen_interfaces);
    let mut ips = Vec::new();

    if !wanted.is_empty() {
        let known: HashSet<&str> = interfaces.iter().map(|(name, _)| name.as_str()).collect();
        for name in &wanted {
            if !known.contains(name) {
                return Err(NetworkError::Interfaces(format!("no interface named {name:?}")));
            }
        }
        for (name, ip) in interfaces {
            if wanted.contains(&name.as_str()) && ip.is_ipv4() && !ips.contains(ip) {
                ips.push(*ip);
            }
        }
        return Ok(ips);
    }

    let extra = split_list(extra_filtered);
    let filtered = |name: &str| {
        DEFAULT_FILTERED_INTERFACES
            .iter()
            .chain(extra.iter())
            .any(|prefix| name.starts_with(prefix))
    };
    for (name, ip) in interfaces {
        if !filtered(name) && ip.is_ipv4() && !ips.contains(ip) {
            ips.push(*ip);
        }
    }
    Ok(ips)
}

fn split_list(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: &str) -> (String, IpAddr) {
        (name.to_string(), ip.parse().unwrap())
    }

    fn sample() -> Vec<(String, IpAddr)> {
        vec![
            iface("eth0", "192.168.1.20"),
            iface("eth0", "fe80::1"),
            iface("docker0", "172.17.0.1"),
            iface("lo", "127.0.0.1"),
        ]
    }

    #[test]
    fn test_default_filters_keep_only_eth0() {
        let ips = select_interface_ips(&sample(), "", "").unwrap();
        assert_eq!(ips, vec!["192.168.1.20".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_extra_filters() {
        let mut ifaces = sample();
        ifaces.push(iface("wg0", "10.8.0.1"));
        ifaces.push(iface("ens3", "10.0.0.3"));
        let ips = select_interface_ips(&ifaces, "", "wg, eth").unwrap();
        assert_eq!(ips, vec!["10.0.0.3".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_listen_interfaces_select_exactly() {
        let ips = select_interface_ips(&sample(), "lo", "").unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let ips = select_interface_ips(&sample(), "eth0,docker0", "").unwrap();
        assert_eq!(ips.len(), 2);
    }

    #[test]
    fn test_unknown_listen_interface_is_error() {
        assert!(matches!(
            select_interface_ips(&sample(), "eth9", ""),
            Err(NetworkError::Interfaces(_))
        ));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
