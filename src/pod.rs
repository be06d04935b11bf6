use std::collections::BTreeMap;

use bytes::Bytes;

/// Pod type carrying a single parameter id in its body, used when walking
/// a node's declared parameter-id list.
pub const POD_TYPE_ID: u32 = 1;

/// An immutable serialized object with a known type id. The runtime never
/// looks inside a pod except for the id-list convention below; building
/// and parsing real parameter pods is the protocol layer's business.
#[derive(Clone, Debug, PartialEq)]
pub struct Pod {
    type_id: u32,
    body: Bytes,
}

impl Pod {
    pub fn new(type_id: u32, body: Bytes) -> Pod {
        Pod { type_id, body }
    }

    pub fn from_id(id: u32) -> Pod {
        let b = vec![
            id as u8,
            (id >> 8) as u8,
            (id >> 16) as u8,
            (id >> 24) as u8,
        ];
        Pod {
            type_id: POD_TYPE_ID,
            body: Bytes::from(b),
        }
    }

    /// Read back an id pod. `None` when the pod is not an id or is short.
    pub fn as_id(&self) -> Option<u32> {
        if self.type_id != POD_TYPE_ID || self.body.len() < 4 {
            return None;
        }
        let b = self.body.as_ref();
        Some(
            u32::from(b[0])
                | u32::from(b[1]) << 8
                | u32::from(b[2]) << 16
                | u32::from(b[3]) << 24,
        )
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn body(&self) -> &[u8] {
        self.body.as_ref()
    }
}

pub mod props {
    pub const DEVICE: &str = "device";
    pub const DEVICE_NAME: &str = "device-name";
    pub const CARD_NAME: &str = "card-name";
    pub const MIN_LATENCY: &str = "min-latency";
    pub const FREQ: &str = "freq";
    pub const VOLUME: &str = "volume";
    pub const LIVE: &str = "live";
}

/// Free-form string properties attached to a node at export time. The
/// typed accessors apply the documented constraints; everything else is
/// passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    items: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Properties {
        Properties {
            items: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(|v| v.as_str())
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.items.insert(key.into(), value.into());
    }

    /// Insert only when the key is not present yet.
    pub fn set_default<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.items.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn iter(&self) -> ::std::collections::btree_map::Iter<String, String> {
        self.items.iter()
    }

    /// Device string, truncated to 64 bytes on a char boundary.
    pub fn device(&self) -> Option<&str> {
        self.get(props::DEVICE).map(|d| {
            if d.len() <= 64 {
                d
            } else {
                let mut end = 64;
                while !d.is_char_boundary(end) {
                    end -= 1;
                }
                &d[..end]
            }
        })
    }

    /// Minimum latency in frames, never below 1.
    pub fn min_latency(&self) -> Option<u32> {
        self.get(props::MIN_LATENCY)
            .and_then(|v| v.parse::<u32>().ok())
            .map(|v| v.max(1))
    }

    pub fn freq(&self) -> Option<f64> {
        self.get(props::FREQ).and_then(|v| v.parse().ok())
    }

    pub fn volume(&self) -> Option<f64> {
        self.get(props::VOLUME).and_then(|v| v.parse().ok())
    }

    pub fn live(&self) -> bool {
        match self.get(props::LIVE) {
            Some("1") | Some("true") => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_pod_round_trip() {
        let p = Pod::from_id(0xdead_0007);
        assert_eq!(p.type_id(), POD_TYPE_ID);
        assert_eq!(p.as_id(), Some(0xdead_0007));

        let other = Pod::new(42, Bytes::from(vec![1, 2, 3, 4]));
        assert_eq!(other.as_id(), None);
    }

    #[test]
    fn device_is_truncated_to_64_bytes() {
        let mut p = Properties::new();
        let long: String = ::std::iter::repeat('x').take(80).collect();
        p.set(props::DEVICE, long);
        assert_eq!(p.device().unwrap().len(), 64);

        p.set(props::DEVICE, "hw:0");
        assert_eq!(p.device(), Some("hw:0"));
    }

    #[test]
    fn min_latency_clamps_to_one() {
        let mut p = Properties::new();
        p.set(props::MIN_LATENCY, "0");
        assert_eq!(p.min_latency(), Some(1));
        p.set(props::MIN_LATENCY, "1024");
        assert_eq!(p.min_latency(), Some(1024));
        p.set(props::MIN_LATENCY, "nope");
        assert_eq!(p.min_latency(), None);
    }

    #[test]
    fn live_and_defaults() {
        let mut p = Properties::new();
        assert!(!p.live());
        p.set(props::LIVE, "1");
        assert!(p.live());

        p.set_default(props::LIVE, "0");
        assert_eq!(p.get(props::LIVE), Some("1"));
        p.set_default(props::FREQ, "600.0");
        assert_eq!(p.freq(), Some(600.0));
    }
}
