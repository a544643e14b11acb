/// Networks whose traffic between each other never leaves the local site
const PRIVATE_RANGES: [&str; 6] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "224.0.0.0/4",
    "255.255.255.255",
];

/// BPF expression keeping only IP traffic that crosses the site boundary.
///
/// Drops non-IP frames, private-to-private traffic, and broadcast/multicast
/// in the kernel so the classifier only sees frames it can attribute.
pub fn default_bpf_filter() -> String {
    let nets = |dir: &str| {
        PRIVATE_RANGES
            .iter()
            .map(|range| format!("{dir} net {range}"))
            .collect::<Vec<_>>()
            .join(" or ")
    };

    format!(
        "(ip or ip6) and not (({}) and ({})) and not (broadcast or multicast)",
        nets("src"),
        nets("dst")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_excludes_private_pairs() {
        let filter = default_bpf_filter();

        assert!(filter.starts_with("(ip or ip6) and not ((src net 10.0.0.0/8 or "));
        assert!(filter.contains("dst net 192.168.0.0/16"));
        assert!(filter.ends_with("and not (broadcast or multicast)"));
    }
}
