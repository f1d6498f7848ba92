// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster objects persisted in the key-value store

use crate::Error;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

/// Arbitrary user-supplied key/value pairs
pub type Metadata = BTreeMap<String, String>;

/// An object stored as JSON at a well-known key
///
/// The version is the modification index of the key the object was loaded
/// from, or 0 for an object that has never been saved.  It is not part of the
/// JSON body.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// plural name used as the key component, e.g. "hypervisors"
    const KIND: &'static str;

    type Id: fmt::Display + FromStr + Clone + Send + Sync;

    fn id(&self) -> Self::Id;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);

    /// Key under which the object with `id` is stored
    fn key(root: &str, id: &Self::Id) -> String {
        format!("{}/{}/{}/metadata", root, Self::KIND, id)
    }

    /// Key of the directory holding everything about the object with `id`
    fn dir(root: &str, id: &Self::Id) -> String {
        format!("{}/{}/{}", root, Self::KIND, id)
    }

    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    fn invalid(&self, message: impl Into<String>) -> Error {
        Error::Invalid {
            kind: Self::KIND,
            id: self.id().to_string(),
            message: message.into(),
        }
    }
}

/// Amount of hypervisor capacity
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Resources {
    /// MiB
    pub memory: u64,
    /// GiB
    pub disk: u64,
    pub cpu: u32,
}

impl Resources {
    /// Returns true if `needed` fits into these resources.
    pub fn fits(&self, needed: &Resources) -> bool {
        self.memory >= needed.memory
            && self.disk >= needed.disk
            && self.cpu >= needed.cpu
    }

    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            memory: self.memory.checked_sub(other.memory)?,
            disk: self.disk.checked_sub(other.disk)?,
            cpu: self.cpu.checked_sub(other.cpu)?,
        })
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
            cpu: self.cpu.saturating_add(other.cpu),
        }
    }
}

macro_rules! impl_uuid_entity {
    ($t:ty, $kind:expr) => {
        impl Entity for $t {
            const KIND: &'static str = $kind;
            type Id = Uuid;

            fn id(&self) -> Uuid {
                self.id
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }

            fn validate(&self) -> Result<(), Error> {
                self.check()
            }
        }
    };
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Hypervisor {
    pub id: Uuid,
    pub ip: Ipv4Addr,
    pub mac: String,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub total_resources: Resources,
    pub available_resources: Resources,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip)]
    pub version: u64,
}

impl Hypervisor {
    fn check(&self) -> Result<(), Error> {
        if !self.total_resources.fits(&self.available_resources) {
            return Err(self.invalid("available resources exceed total"));
        }
        Ok(())
    }
}

impl_uuid_entity!(Hypervisor, "hypervisors");

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Guest {
    pub id: Uuid,
    pub flavor_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fwgroup_id: Option<Uuid>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip)]
    pub version: u64,
}

impl Guest {
    /// Returns a guest that has not been saved or placed yet.
    pub fn new(flavor_id: Uuid) -> Guest {
        Guest {
            id: Uuid::new_v4(),
            flavor_id,
            hypervisor_id: None,
            subnet_id: None,
            network_id: None,
            fwgroup_id: None,
            image: String::new(),
            mac: String::new(),
            ip: None,
            metadata: Metadata::new(),
            version: 0,
        }
    }

    fn check(&self) -> Result<(), Error> {
        if self.ip.is_some() && self.subnet_id.is_none() {
            return Err(self.invalid("an IP address requires a subnet"));
        }
        Ok(())
    }
}

impl_uuid_entity!(Guest, "guests");

/// Resource requirements that guests refer to by ID
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Flavor {
    pub id: Uuid,
    pub name: String,
    pub resources: Resources,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip)]
    pub version: u64,
}

impl Flavor {
    fn check(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(self.invalid("name is empty"));
        }
        Ok(())
    }
}

impl_uuid_entity!(Flavor, "flavors");

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Subnet {
    pub id: Uuid,
    /// e.g. "10.10.0.0/24"
    pub cidr: String,
    pub gateway: Ipv4Addr,
    pub start_range: Ipv4Addr,
    pub end_range: Ipv4Addr,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip)]
    pub version: u64,
}

impl Subnet {
    /// Returns the network address and netmask of this subnet.
    pub fn network(&self) -> Result<(Ipv4Addr, Ipv4Addr), Error> {
        parse_cidr(&self.cidr).ok_or_else(|| {
            self.invalid(format!("bad CIDR {:?}", self.cidr))
        })
    }

    fn check(&self) -> Result<(), Error> {
        self.network()?;
        if u32::from(self.start_range) > u32::from(self.end_range) {
            return Err(self.invalid("range start is after range end"));
        }
        Ok(())
    }
}

impl_uuid_entity!(Subnet, "subnets");

/// Parses "a.b.c.d/len" into a (network, netmask) pair.
pub fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let (addr, len) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let len: u32 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
    Some((Ipv4Addr::from(u32::from(addr) & mask), Ipv4Addr::from(mask)))
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Network {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip)]
    pub version: u64,
}

impl Network {
    fn check(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl_uuid_entity!(Network, "networks");

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        })
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Drop,
}

/// One inbound rule of a firewall group
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FWRule {
    /// source CIDR; empty means any
    #[serde(default)]
    pub source: String,
    pub protocol: Protocol,
    /// ignored for ICMP
    #[serde(default)]
    pub port_start: u16,
    #[serde(default)]
    pub port_end: u16,
    pub action: RuleAction,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FWGroup {
    pub id: Uuid,
    #[serde(default)]
    pub rules: Vec<FWRule>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip)]
    pub version: u64,
}

impl FWGroup {
    fn check(&self) -> Result<(), Error> {
        for rule in &self.rules {
            if rule.port_start > rule.port_end {
                return Err(self.invalid(format!(
                    "port range {}-{} is empty",
                    rule.port_start, rule.port_end
                )));
            }
            if !rule.source.is_empty() && parse_cidr(&rule.source).is_none() {
                return Err(
                    self.invalid(format!("bad source {:?}", rule.source))
                );
            }
        }
        Ok(())
    }
}

impl_uuid_entity!(FWGroup, "fwgroups");

/// A VLAN, identified by its 802.1Q tag
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Vlan {
    pub tag: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip)]
    pub version: u64,
}

impl Entity for Vlan {
    const KIND: &'static str = "vlans";
    type Id = u16;

    fn id(&self) -> u16 {
        self.tag
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn validate(&self) -> Result<(), Error> {
        if self.tag == 0 || self.tag > 4094 {
            return Err(self.invalid("tag must be between 1 and 4094"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VlanGroup {
    pub id: Uuid,
    #[serde(default)]
    pub vlans: Vec<u16>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip)]
    pub version: u64,
}

impl VlanGroup {
    fn check(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl_uuid_entity!(VlanGroup, "vlangroups");

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_cidr() {
        assert_eq!(
            parse_cidr("10.10.3.7/24"),
            Some((
                Ipv4Addr::new(10, 10, 3, 0),
                Ipv4Addr::new(255, 255, 255, 0)
            ))
        );
        assert_eq!(
            parse_cidr("0.0.0.0/0"),
            Some((Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED))
        );
        assert_eq!(parse_cidr("10.0.0.0/33"), None);
        assert_eq!(parse_cidr("10.0.0.0"), None);
    }

    #[test]
    fn test_resources() {
        let big = Resources { memory: 8192, disk: 100, cpu: 8 };
        let small = Resources { memory: 1024, disk: 10, cpu: 2 };
        assert!(big.fits(&small));
        assert!(!small.fits(&big));
        assert_eq!(
            big.checked_sub(&small),
            Some(Resources { memory: 7168, disk: 90, cpu: 6 })
        );
        assert_eq!(small.checked_sub(&big), None);
        let left = big.checked_sub(&small).unwrap();
        assert_eq!(left.saturating_add(&small), big);
    }

    #[test]
    fn test_validation() {
        let mut vlan = Vlan {
            tag: 0,
            description: String::new(),
            metadata: Metadata::new(),
            version: 0,
        };
        assert_matches!(vlan.validate(), Err(Error::Invalid { .. }));
        vlan.tag = 100;
        vlan.validate().unwrap();

        let mut guest = Guest::new(Uuid::new_v4());
        guest.validate().unwrap();
        guest.ip = Some(Ipv4Addr::new(10, 0, 0, 5));
        assert_matches!(
            guest.validate(),
            Err(Error::Invalid { kind: "guests", .. })
        );

        let group = FWGroup {
            id: Uuid::new_v4(),
            rules: vec![FWRule {
                source: String::new(),
                protocol: Protocol::Tcp,
                port_start: 443,
                port_end: 80,
                action: RuleAction::Allow,
            }],
            metadata: Metadata::new(),
            version: 0,
        };
        assert_matches!(group.validate(), Err(Error::Invalid { .. }));
    }

    #[test]
    fn test_version_not_serialized() {
        let mut guest = Guest::new(Uuid::new_v4());
        guest.version = 42;
        let json = serde_json::to_value(&guest).unwrap();
        assert!(json.get("version").is_none());
        assert!(json.get("hypervisor_id").is_none());
        let back: Guest = serde_json::from_value(json).unwrap();
        assert_eq!(back.version, 0);
        assert_eq!(back.id, guest.id);
    }
}
