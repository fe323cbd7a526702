use super::text_values;
use crate::env::env_subst;
use crate::error::AutomationError;
use crate::inventory::is_inventory_key;
use crate::transport::{EventSender, TransportJob};
use crate::types::BuiltinValue;
use crate::Result;
use std::net::Ipv4Addr;

const PRIVATE_NETWORKS: [(Ipv4Addr, u32); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

fn private_ranges_label() -> String {
    PRIVATE_NETWORKS
        .iter()
        .map(|(net, mask)| format!("{}/{}", net, mask))
        .collect::<Vec<_>>()
        .join(" or ")
}

fn parse_cidr(value: &str) -> Option<(Ipv4Addr, u32)> {
    let parts: Vec<&str> = value.trim().split('/').collect();
    let [address, mask] = parts.as_slice() else {
        return None;
    };
    let mask = mask.parse::<u32>().ok().filter(|m| (1..=32).contains(m))?;
    let address = address.parse::<Ipv4Addr>().ok()?;
    Some((address, mask))
}

fn netmask(mask: u32) -> u32 {
    u32::MAX.checked_shl(32 - mask).unwrap_or(0)
}

/// `a.b.c.d/m`，掩码 1..=32
pub fn is_cidr(value: &str) -> bool {
    parse_cidr(value).is_some()
}

/// 网段首地址或末地址落在私有地址段内
pub fn is_private_cidr(value: &str) -> bool {
    let Some((address, mask)) = parse_cidr(value) else {
        return false;
    };
    let first = u32::from(address) & netmask(mask);
    let last = first | !netmask(mask);
    PRIVATE_NETWORKS.iter().any(|(net, net_mask)| {
        let net = u32::from(*net);
        let m = netmask(*net_mask);
        first & m == net || last & m == net
    })
}

pub(super) fn run(
    job: &TransportJob,
    values: &[BuiltinValue],
    private_only: bool,
    events: &EventSender,
) -> Result<()> {
    let texts = text_values(values);
    if values.len() != 1 || texts.len() != 1 {
        return Err(AutomationError::BuiltinError(
            "At least one and only one value must be provided".to_string(),
        ));
    }

    let mut value = texts[0].clone();
    if is_inventory_key(&value) {
        if let Some(inventory) = job.ctx.inventory_snapshot()? {
            value = inventory.resolve_attribute_value(&value, &job.operation.environment);
        }
    }
    let network = env_subst(&value, &job.operation.environment);

    if !is_cidr(&network) {
        return Err(AutomationError::BuiltinError(format!(
            "This network is not in CIDR format: '{}'. eg: 172.28.28.0/24",
            network
        )));
    }
    if private_only {
        if !is_private_cidr(&network) {
            return Err(AutomationError::BuiltinError(format!(
                "This network is not a private network. Range is: {}",
                private_ranges_label()
            )));
        }
        events.stdout(&format!(
            "[INFO] The network provided: {} is in CIDR format and private",
            network
        ));
    } else {
        events.stdout(&format!(
            "[INFO] This network provided: {} is in CIDR format",
            network
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_cidr() {
        assert!(is_cidr("172.28.28.0/24"));
        assert!(is_cidr(" 10.0.0.0/8 "));
        assert!(!is_cidr("10.0.0.0"));
        assert!(!is_cidr("10.0.0.0/0"));
        assert!(!is_cidr("10.0.0.0/33"));
        assert!(!is_cidr("10.0.0/24/1"));
        assert!(!is_cidr("not-an-ip/24"));
    }

    #[test]
    fn test_is_private_cidr() {
        assert!(is_private_cidr("192.168.1.0/24"));
        assert!(is_private_cidr("172.20.0.0/16"));
        assert!(is_private_cidr("10.1.2.0/24"));
        assert!(!is_private_cidr("8.8.8.0/24"));
        assert!(!is_private_cidr("172.32.0.0/16"));
    }

    #[test]
    fn test_wide_network_overlapping_private_range() {
        // 末地址 11.255.255.255 不在私有段，首地址 10.0.0.0 在
        assert!(is_private_cidr("10.0.0.0/7"));
    }

    #[test]
    fn test_private_ranges_label() {
        assert_eq!(
            private_ranges_label(),
            "10.0.0.0/8 or 172.16.0.0/12 or 192.168.0.0/16"
        );
    }
}
