use std::net::Ipv4Addr;

/// Smallest valid IPv4 header (IHL = 5).
pub const MIN_IPV4_HEADER_LEN: usize = 20;

const SRC_ADDR_OFFSET: usize = 12;
const DST_ADDR_OFFSET: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Endpoints {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

// Bounds-checked view of `N` bytes at `offset`.
#[inline(always)]
fn field_at<const N: usize>(packet: &[u8], offset: usize) -> Option<[u8; N]> {
    packet.get(offset..offset.checked_add(N)?)?.try_into().ok()
}

/// IP version from the high nibble of the first byte.
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

/// Source and destination of an IPv4 packet. `None` for short buffers or
/// anything that is not IPv4.
pub fn ipv4_endpoints(packet: &[u8]) -> Option<Ipv4Endpoints> {
    if packet.len() < MIN_IPV4_HEADER_LEN || ip_version(packet)? != 4 {
        return None;
    }
    let source = field_at::<4>(packet, SRC_ADDR_OFFSET)?;
    let destination = field_at::<4>(packet, DST_ADDR_OFFSET)?;
    Some(Ipv4Endpoints {
        source: Ipv4Addr::from(source),
        destination: Ipv4Addr::from(destination),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut h = vec![0u8; MIN_IPV4_HEADER_LEN];
        h[0] = 0x45;
        h[9] = 6;
        h[12..16].copy_from_slice(&src);
        h[16..20].copy_from_slice(&dst);
        h
    }

    #[test]
    fn test_ipv4_endpoints() {
        let pkt = header([10, 0, 0, 2], [93, 184, 216, 34]);
        let ep = ipv4_endpoints(&pkt).unwrap();
        assert_eq!(ep.source, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ep.destination, Ipv4Addr::new(93, 184, 216, 34));
    }

    #[test]
    fn test_ipv4_endpoints_rejects_short_and_non_v4() {
        let pkt = header([10, 0, 0, 2], [1, 1, 1, 1]);
        assert_eq!(ipv4_endpoints(&pkt[..19]), None);
        assert_eq!(ipv4_endpoints(&[]), None);

        let mut v6 = pkt.clone();
        v6[0] = 0x60;
        assert_eq!(ip_version(&v6), Some(6));
        assert_eq!(ipv4_endpoints(&v6), None);
    }
}
