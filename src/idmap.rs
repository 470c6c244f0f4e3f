use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// One uid or gid range mapping between the container view and the host
/// view, in the same shape as `/proc/self/uid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    fn to_host(&self, id: u32) -> Option<u32> {
        if id >= self.container_id && id - self.container_id < self.size {
            Some(self.host_id + (id - self.container_id))
        } else {
            None
        }
    }

    fn to_container(&self, id: u32) -> Option<u32> {
        if id >= self.host_id && id - self.host_id < self.size {
            Some(self.container_id + (id - self.host_id))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapOptions {
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    pub rootless: bool,
    pub translate_overlay_whiteouts: bool,
}

impl MapOptions {
    /// Maps a container-view uid to the host view.
    pub fn uid_to_host(&self, uid: u32) -> Result<u32> {
        first_match(&self.uid_mappings, uid, IdMapping::to_host, "uid")
    }

    pub fn gid_to_host(&self, gid: u32) -> Result<u32> {
        first_match(&self.gid_mappings, gid, IdMapping::to_host, "gid")
    }

    /// Maps a host-view uid (as observed on disk) to the container view
    /// recorded in tar headers.
    pub fn uid_to_container(&self, uid: u32) -> Result<u32> {
        first_match(&self.uid_mappings, uid, IdMapping::to_container, "uid")
    }

    pub fn gid_to_container(&self, gid: u32) -> Result<u32> {
        first_match(&self.gid_mappings, gid, IdMapping::to_container, "gid")
    }
}

fn first_match(
    mappings: &[IdMapping],
    id: u32,
    map: impl Fn(&IdMapping, u32) -> Option<u32>,
    what: &str,
) -> Result<u32> {
    // An empty mapping list is the identity mapping.
    if mappings.is_empty() {
        return Ok(id);
    }
    for mapping in mappings {
        if let Some(mapped) = map(mapping, id) {
            return Ok(mapped);
        }
    }
    bail!("{what} {id} is not covered by any mapping")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rootless_mapping() -> MapOptions {
        MapOptions {
            uid_mappings: vec![IdMapping {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
            gid_mappings: vec![IdMapping {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
            ..MapOptions::default()
        }
    }

    #[test]
    fn empty_mappings_are_identity() {
        let opt = MapOptions::default();
        assert_eq!(opt.uid_to_container(1234).unwrap(), 1234);
        assert_eq!(opt.gid_to_host(0).unwrap(), 0);
    }

    #[test]
    fn host_root_maps_to_container_root() {
        let opt = rootless_mapping();
        assert_eq!(opt.uid_to_container(100000).unwrap(), 0);
        assert_eq!(opt.uid_to_container(100005).unwrap(), 5);
        assert_eq!(opt.gid_to_container(165535).unwrap(), 65535);
    }

    #[test]
    fn container_to_host_inverts() {
        let opt = rootless_mapping();
        for uid in [0, 1, 999, 65535] {
            let host = opt.uid_to_host(uid).unwrap();
            assert_eq!(opt.uid_to_container(host).unwrap(), uid);
        }
    }

    #[test]
    fn unmapped_id_is_an_error() {
        let opt = rootless_mapping();
        assert!(opt.uid_to_container(5).is_err());
        assert!(opt.uid_to_container(165536).is_err());
        assert!(opt.uid_to_host(65536).is_err());
    }

    #[test]
    fn first_matching_range_wins() {
        let opt = MapOptions {
            uid_mappings: vec![
                IdMapping {
                    container_id: 0,
                    host_id: 1000,
                    size: 10,
                },
                IdMapping {
                    container_id: 0,
                    host_id: 2000,
                    size: 10,
                },
            ],
            ..MapOptions::default()
        };
        assert_eq!(opt.uid_to_host(3).unwrap(), 1003);
        assert_eq!(opt.uid_to_container(2003).unwrap(), 3);
    }
}
